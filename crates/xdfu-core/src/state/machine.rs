//! Session state for one firmware transfer.

use std::fmt;

use crate::error::ErrorCode;

/// Phase of the DFU state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DfuPhase {
    /// No session.
    #[default]
    Idle,
    /// Resetting the peripheral into DFU mode.
    Initiating,
    /// Writing chunks.
    Transferring,
    /// Waiting for the peripheral's integrity check.
    Verifying,
    /// Rebooting into the new image and confirming its version.
    Committing,
    /// Returning the peripheral to its previous firmware.
    Aborting,
}

impl fmt::Display for DfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuPhase::Idle => write!(f, "IDLE"),
            DfuPhase::Initiating => write!(f, "INITIATING"),
            DfuPhase::Transferring => write!(f, "TRANSFERRING"),
            DfuPhase::Verifying => write!(f, "VERIFYING"),
            DfuPhase::Committing => write!(f, "COMMITTING"),
            DfuPhase::Aborting => write!(f, "ABORTING"),
        }
    }
}

impl DfuPhase {
    /// Phases in which a cancel request is still honored.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, DfuPhase::Initiating | DfuPhase::Transferring)
    }
}

/// Runtime state of an in-flight transfer.
///
/// Created when a flash starts and dropped when the machine returns to
/// `Idle`. Owned by the engine; nothing else mutates it.
#[derive(Debug)]
pub struct TransferSession {
    /// Bytes accepted by the peripheral so far.
    pub cursor: usize,
    /// Image length.
    pub total: usize,
    /// Bytes per chunk, except possibly the last.
    pub chunk_size: usize,
    pub phase: DfuPhase,
    /// Set when the session heads for `Aborting`.
    pub last_error: Option<ErrorCode>,
    pub chunks_sent: usize,
    pub cancel_requested: bool,
    /// DFU entry was attempted, so the peripheral may need rolling back.
    pub entered: bool,
    /// `REBOOT` has been issued.
    pub committed: bool,
    /// Version reads attempted since the commit.
    pub version_polls: u32,
}

impl TransferSession {
    pub fn new(total: usize, chunk_size: usize) -> Self {
        Self {
            cursor: 0,
            total,
            chunk_size: chunk_size.max(1),
            phase: DfuPhase::Initiating,
            last_error: None,
            chunks_sent: 0,
            cancel_requested: false,
            entered: false,
            committed: false,
            version_polls: 0,
        }
    }

    /// Transition to a new phase.
    pub fn goto_phase(&mut self, phase: DfuPhase) {
        tracing::info!(from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
    }

    /// Record a terminal failure and head for `Aborting`.
    ///
    /// The first recorded code wins; later failures while aborting are not
    /// reported.
    pub fn fail(&mut self, code: ErrorCode, reason: impl fmt::Display) {
        tracing::error!(phase = %self.phase, code = code.as_u8(), "{}", reason);
        if self.last_error.is_none() {
            self.last_error = Some(code);
        }
        if self.phase != DfuPhase::Aborting {
            self.goto_phase(DfuPhase::Aborting);
        }
    }

    /// Chunks in the whole image.
    pub fn total_chunks(&self) -> usize {
        self.total.div_ceil(self.chunk_size)
    }

    /// Length of the chunk starting at the cursor.
    pub fn next_chunk_len(&self) -> usize {
        self.chunk_size.min(self.total - self.cursor.min(self.total))
    }

    pub fn advance(&mut self, len: usize) {
        self.cursor += len;
        self.chunks_sent += 1;
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.total
    }

    /// Fraction of the image accepted so far.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        self.cursor as f32 / self.total as f32
    }
}
