//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext, SessionOutcome, step};
pub use machine::{DfuPhase, TransferSession};
