//! Request framing for the DFU controller servicer.

use super::constants::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("DNLOAD payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Control status 0x{0:02X} (expected CTRL_DONE)")]
    ControlStatus(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request understood by the DFU controller servicer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// Download one block of image data.
    Dnload(&'a [u8]),
    /// Zero-length download concluding the image.
    DnloadFinal,
    GetStatus,
    GetVersion,
    SetAlternate(u8),
    Reboot,
    Abort,
}

impl Request<'_> {
    /// Bytes to write on the bus for this request.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let resid = DFU_CONTROLLER_SERVICER_RESID;
        let frame = match *self {
            Request::Dnload(data) => {
                if data.len() > MAX_XFER {
                    return Err(FrameError::PayloadTooLarge {
                        len: data.len(),
                        max: MAX_XFER,
                    });
                }
                let mut frame = Vec::with_capacity(DNLOAD_FRAME_LEN);
                frame.extend_from_slice(&[resid, DFU_CMD_DNLOAD, DNLOAD_PAYLOAD_LEN]);
                frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
                frame.extend_from_slice(data);
                // The servicer always expects a full block
                frame.resize(DNLOAD_FRAME_LEN, 0);
                frame
            }
            Request::DnloadFinal => {
                let mut frame = vec![0u8; DNLOAD_FRAME_LEN];
                frame[..3].copy_from_slice(&[resid, DFU_CMD_DNLOAD, DNLOAD_PAYLOAD_LEN]);
                frame
            }
            Request::GetStatus => vec![
                resid,
                DFU_CMD_GETSTATUS | DFU_COMMAND_READ_BIT,
                STATUS_RESPONSE_LEN as u8,
            ],
            Request::GetVersion => vec![
                resid,
                DFU_CMD_GETVERSION | DFU_COMMAND_READ_BIT,
                VERSION_RESPONSE_LEN as u8,
            ],
            Request::SetAlternate(alt) => vec![resid, DFU_CMD_SETALTERNATE, 1, alt],
            Request::Reboot => vec![resid, DFU_CMD_REBOOT, 1, 0],
            Request::Abort => vec![resid, DFU_CMD_ABORT, 1, 0],
        };
        Ok(frame)
    }

    /// Number of bytes to read back after writing, for read commands.
    pub fn response_len(&self) -> Option<usize> {
        match self {
            Request::GetStatus => Some(STATUS_RESPONSE_LEN),
            Request::GetVersion => Some(VERSION_RESPONSE_LEN),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Dnload(_) => "DNLOAD",
            Request::DnloadFinal => "DNLOAD(final)",
            Request::GetStatus => "GETSTATUS",
            Request::GetVersion => "GETVERSION",
            Request::SetAlternate(_) => "SETALTERNATE",
            Request::Reboot => "REBOOT",
            Request::Abort => "ABORT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dnload_frame_layout() {
        let data = [0xAAu8; 5];
        let frame = Request::Dnload(&data).encode().unwrap();
        assert_eq!(frame.len(), DNLOAD_FRAME_LEN);
        assert_eq!(&frame[..5], &[0xF0, 0x01, 0x82, 5, 0]);
        assert_eq!(&frame[5..10], &data);
        assert!(frame[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dnload_final_is_zero_length() {
        let frame = Request::DnloadFinal.encode().unwrap();
        assert_eq!(frame.len(), DNLOAD_FRAME_LEN);
        assert_eq!(&frame[..5], &[0xF0, 0x01, 0x82, 0, 0]);
    }

    #[test]
    fn test_dnload_rejects_oversized_block() {
        let data = vec![0u8; MAX_XFER + 1];
        assert!(matches!(
            Request::Dnload(&data).encode(),
            Err(FrameError::PayloadTooLarge { len: 129, max: 128 })
        ));
    }

    #[test]
    fn test_control_requests() {
        assert_eq!(Request::GetStatus.encode().unwrap(), vec![0xF0, 0x83, 6]);
        assert_eq!(Request::GetVersion.encode().unwrap(), vec![0xF0, 0xD8, 4]);
        assert_eq!(
            Request::SetAlternate(DFU_ALTERNATE_UPGRADE).encode().unwrap(),
            vec![0xF0, 0x40, 1, 1]
        );
        assert_eq!(Request::Reboot.encode().unwrap(), vec![0xF0, 0x59, 1, 0]);
        assert_eq!(Request::Abort.encode().unwrap(), vec![0xF0, 0x06, 1, 0]);
    }

    #[test]
    fn test_response_lengths() {
        assert_eq!(Request::GetStatus.response_len(), Some(6));
        assert_eq!(Request::GetVersion.response_len(), Some(4));
        assert_eq!(Request::Reboot.response_len(), None);
    }
}
