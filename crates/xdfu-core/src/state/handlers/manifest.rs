//! Manifestation handlers (Verifying, Committing).

use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::events::DfuEvent;
use crate::state::machine::DfuPhase;
use crate::transport::{DfuTransport, Verification};

use super::{HandleResult, HandlerContext, SessionOutcome};

/// Wait for the peripheral's own integrity check.
pub fn handle_verify<T: DfuTransport>(ctx: &mut HandlerContext<'_, T>) -> HandleResult {
    match ctx.transport.verify() {
        Ok(Verification::Passed) => {
            info!("Image verified by peripheral");
            ctx.session.goto_phase(DfuPhase::Committing);
        }
        Ok(Verification::Failed { state, status }) => ctx.session.fail(
            ErrorCode::VerificationFailed,
            format!("Peripheral rejected the image (state {state}, status {status})"),
        ),
        Err(e) => ctx.session.fail(e.code(), e),
    }
    HandleResult::Continue
}

/// Reboot into the new image, then poll until it reports its version.
///
/// The first step issues `REBOOT`; each later step makes one version read.
pub fn handle_commit<T: DfuTransport>(ctx: &mut HandlerContext<'_, T>) -> HandleResult {
    if !ctx.session.committed {
        match ctx.transport.commit() {
            Ok(()) => {
                info!("Rebooting into new image");
                ctx.session.committed = true;
            }
            Err(e) => ctx.session.fail(e.code(), e),
        }
        return HandleResult::Continue;
    }

    let expected = ctx.image.version();
    let attempts = ctx.settings.version_poll_attempts;
    ctx.transport.delay_ms(ctx.settings.version_poll_interval_ms);
    ctx.session.version_polls += 1;
    let attempt = ctx.session.version_polls;

    match ctx.transport.read_version() {
        Ok(running) if running == expected => {
            info!(version = %running, "New firmware running");
            ctx.emit(DfuEvent::End);
            ctx.session.goto_phase(DfuPhase::Idle);
            return HandleResult::Finished(SessionOutcome::Completed);
        }
        Ok(running) if running.is_valid() => ctx.session.fail(
            ErrorCode::VerificationFailed,
            format!("Peripheral booted {running}, expected {expected}"),
        ),
        Ok(_) if attempt >= attempts => ctx.session.fail(
            ErrorCode::Timeout,
            format!("No version reported after {attempts} attempts"),
        ),
        Ok(_) => debug!(attempt, "Peripheral has not reported a version yet"),
        Err(e) if attempt >= attempts => ctx.session.fail(
            ErrorCode::Timeout,
            format!("No version reported after {attempts} attempts: {e}"),
        ),
        Err(e) => debug!(attempt, error = %e, "Peripheral not answering yet"),
    }
    HandleResult::Continue
}
