//! Session-level errors and the coarse codes carried by `Error` events.

use std::fmt;
use thiserror::Error;

use crate::state::DfuPhase;

/// Code reported to `on_error` listeners when a session ends in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Bus failure that outlived the retry budget, or a malformed reply.
    CommunicationError = 1,
    /// The peripheral stayed busy past the ready timeout.
    Timeout = 2,
    /// The peripheral rejected the image or booted the wrong version.
    VerificationFailed = 3,
    /// The peripheral entered an unexpected DFU state.
    BadState = 4,
    /// The session was cancelled at a chunk boundary.
    Cancelled = 5,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code.as_u8()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::CommunicationError => write!(f, "communication error"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::VerificationFailed => write!(f, "verification failed"),
            ErrorCode::BadState => write!(f, "bad state"),
            ErrorCode::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Synchronous rejection of a flash or setup request.
///
/// Failures inside a running session never surface here; they end the
/// session through `Aborting` and one `Error` event.
#[derive(Error, Debug)]
pub enum DfuError {
    #[error("A firmware update is already in progress ({phase})")]
    SessionActive { phase: DfuPhase },

    #[error("No firmware image is bundled for this device")]
    NoFirmware,

    #[error("Communication with the device failed: {0}")]
    Unreachable(#[from] crate::transport::TransportError),
}
