//! Phase handlers - one bounded step of the DFU state machine.
//!
//! This module is split into submodules by phase:
//! - `download`: Initiating and Transferring
//! - `manifest`: Verifying and Committing
//! - `control`: Aborting

mod control;
mod download;
mod manifest;

use crate::config::DeviceSettings;
use crate::error::ErrorCode;
use crate::events::{DfuEvent, EventBus};
use crate::image::FirmwareImage;
use crate::state::machine::{DfuPhase, TransferSession};
use crate::transport::DfuTransport;

use control::handle_abort;
use download::{handle_initiate, handle_transfer};
use manifest::{handle_commit, handle_verify};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// New firmware committed and running.
    Completed,
    /// Aborted; the peripheral runs its previous firmware.
    Failed(ErrorCode),
}

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// More steps are needed.
    Continue,
    /// The session is over and the machine is back in `Idle`.
    Finished(SessionOutcome),
}

/// Handler context containing all resources of the running session.
pub struct HandlerContext<'a, T: DfuTransport> {
    pub transport: &'a mut T,
    pub events: &'a mut EventBus,
    pub session: &'a mut TransferSession,
    pub image: &'a FirmwareImage,
    pub settings: &'a DeviceSettings,
}

impl<'a, T: DfuTransport> HandlerContext<'a, T> {
    pub(crate) fn emit(&mut self, event: DfuEvent) {
        self.events.dispatch(event);
    }
}

/// Advance the session by one step of its current phase.
pub fn step<T: DfuTransport>(ctx: &mut HandlerContext<'_, T>) -> HandleResult {
    match ctx.session.phase {
        DfuPhase::Idle => HandleResult::Finished(
            ctx.session
                .last_error
                .map_or(SessionOutcome::Completed, SessionOutcome::Failed),
        ),
        DfuPhase::Initiating => handle_initiate(ctx),
        DfuPhase::Transferring => handle_transfer(ctx),
        DfuPhase::Verifying => handle_verify(ctx),
        DfuPhase::Committing => handle_commit(ctx),
        DfuPhase::Aborting => handle_abort(ctx),
    }
}
