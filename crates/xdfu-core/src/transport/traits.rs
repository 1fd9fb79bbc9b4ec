//! Transport layer abstraction.
//!
//! Defines the `DfuTransport` trait the state machine drives, so the I2C
//! implementation can be swapped for a scripted one in tests.

use embedded_hal::i2c::ErrorKind;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::image::Version;
use crate::protocol::{DeviceStatus, DfuState, FrameError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bus error during {op}: {kind}")]
    Bus { op: &'static str, kind: ErrorKind },

    #[error("{op} failed after {attempts} attempts: {kind}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u8,
        kind: ErrorKind,
    },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u32 },

    #[error("Peripheral rejected {op}: state {state}, status {status}")]
    Rejected {
        op: &'static str,
        state: DfuState,
        status: u8,
    },

    #[error("Unexpected peripheral state {0}")]
    UnexpectedState(DfuState),

    #[error("Chunk at offset {offset} out of sequence (expected {expected})")]
    OutOfSequence { offset: usize, expected: usize },

    #[error("Chunk of {len} bytes outside 1..={max}")]
    ChunkSize { len: usize, max: usize },

    #[error("Reset line error: {0}")]
    ResetLine(String),

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// Coarse code reported when this error ends a session.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Timeout { .. } => ErrorCode::Timeout,
            TransportError::Rejected { .. } | TransportError::UnexpectedState(_) => {
                ErrorCode::BadState
            }
            _ => ErrorCode::CommunicationError,
        }
    }
}

/// Peripheral acknowledgement of an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub state: DfuState,
    pub poll_timeout_ms: u32,
}

/// Outcome of the peripheral's own integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Passed,
    Failed { state: DfuState, status: u8 },
}

/// Abstract DFU transport.
///
/// All methods block for bounded, bus-speed-limited durations. Transient bus
/// errors are retried inside the implementation; an `Err` is final.
pub trait DfuTransport {
    /// Largest chunk `write_chunk` accepts.
    fn max_chunk_size(&self) -> usize;

    /// Pulse the reset line and wait for the peripheral to boot.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Reset the peripheral into DFU mode, ready for the first chunk.
    fn enter_bootloader(&mut self) -> Result<(), TransportError>;

    /// Write one chunk and confirm the peripheral accepted it.
    fn write_chunk(&mut self, offset: usize, data: &[u8]) -> Result<Ack, TransportError>;

    /// Read the peripheral's DFU status.
    fn read_status(&mut self) -> Result<DeviceStatus, TransportError>;

    /// Signal the end of the image.
    fn finish_download(&mut self) -> Result<(), TransportError>;

    /// Wait for the peripheral's integrity check result.
    fn verify(&mut self) -> Result<Verification, TransportError>;

    /// Apply the new image and reboot into it.
    fn commit(&mut self) -> Result<(), TransportError>;

    /// Discard the transfer and reboot the peripheral into its previous image.
    fn abort(&mut self) -> Result<(), TransportError>;

    /// Read the running firmware version.
    fn read_version(&mut self) -> Result<Version, TransportError>;

    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::NoAcknowledgeSource;

    #[test]
    fn test_error_codes() {
        let nack = ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data);
        assert_eq!(
            TransportError::RetriesExhausted {
                op: "DNLOAD",
                attempts: 3,
                kind: nack
            }
            .code(),
            ErrorCode::CommunicationError
        );
        assert_eq!(
            TransportError::Timeout { timeout_ms: 1000 }.code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            TransportError::UnexpectedState(DfuState::Error).code(),
            ErrorCode::BadState
        );
    }
}
