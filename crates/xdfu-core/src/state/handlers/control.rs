//! Abort handler.

use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::events::DfuEvent;
use crate::state::machine::DfuPhase;
use crate::transport::DfuTransport;

use super::{HandleResult, HandlerContext, SessionOutcome};

/// Return the peripheral to its previous firmware and report the failure.
pub fn handle_abort<T: DfuTransport>(ctx: &mut HandlerContext<'_, T>) -> HandleResult {
    let code = ctx
        .session
        .last_error
        .unwrap_or(ErrorCode::CommunicationError);

    if !ctx.session.entered {
        debug!("Peripheral never left its firmware, nothing to roll back");
    } else if let Err(e) = ctx.transport.abort() {
        warn!(error = %e, "Abort did not complete cleanly");
    }

    ctx.emit(DfuEvent::Error(code));
    ctx.session.goto_phase(DfuPhase::Idle);
    HandleResult::Finished(SessionOutcome::Failed(code))
}
