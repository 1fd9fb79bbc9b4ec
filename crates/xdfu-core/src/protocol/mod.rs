//! Protocol module - XMOS DFU servicer wire format.

pub mod constants;
pub mod frame;
pub mod status;

pub use constants::*;
pub use frame::{FrameError, Request};
pub use status::{DeviceStatus, DfuState, parse_version};
