//! Response parsing for GETSTATUS and GETVERSION.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

use super::constants::*;
use super::frame::FrameError;
use crate::image::Version;

/// DFU state reported by the servicer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    Idle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl DfuState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            DFU_STATE_APP_IDLE => DfuState::AppIdle,
            DFU_STATE_APP_DETACH => DfuState::AppDetach,
            DFU_STATE_IDLE => DfuState::Idle,
            DFU_STATE_DNLOAD_SYNC => DfuState::DnloadSync,
            DFU_STATE_DNBUSY => DfuState::DnBusy,
            DFU_STATE_DNLOAD_IDLE => DfuState::DnloadIdle,
            DFU_STATE_MANIFEST_SYNC => DfuState::ManifestSync,
            DFU_STATE_MANIFEST => DfuState::Manifest,
            DFU_STATE_MANIFEST_WAIT_RESET => DfuState::ManifestWaitReset,
            DFU_STATE_UPLOAD_IDLE => DfuState::UploadIdle,
            DFU_STATE_ERROR => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            DfuState::AppIdle => DFU_STATE_APP_IDLE,
            DfuState::AppDetach => DFU_STATE_APP_DETACH,
            DfuState::Idle => DFU_STATE_IDLE,
            DfuState::DnloadSync => DFU_STATE_DNLOAD_SYNC,
            DfuState::DnBusy => DFU_STATE_DNBUSY,
            DfuState::DnloadIdle => DFU_STATE_DNLOAD_IDLE,
            DfuState::ManifestSync => DFU_STATE_MANIFEST_SYNC,
            DfuState::Manifest => DFU_STATE_MANIFEST,
            DfuState::ManifestWaitReset => DFU_STATE_MANIFEST_WAIT_RESET,
            DfuState::UploadIdle => DFU_STATE_UPLOAD_IDLE,
            DfuState::Error => DFU_STATE_ERROR,
            DfuState::Unknown(v) => *v,
        }
    }

    /// The servicer accepts the next request in these states.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            DfuState::Idle | DfuState::DnloadIdle | DfuState::ManifestWaitReset
        )
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::Idle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::Error => write!(f, "dfuERROR"),
            DfuState::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

/// Parsed GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// DFU `bStatus`.
    pub status: u8,
    /// Minimum delay before the next status request.
    pub poll_timeout_ms: u32,
    pub state: DfuState,
}

impl DeviceStatus {
    /// Parse `ctrl status t0 t1 t2 state`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < STATUS_RESPONSE_LEN {
            return Err(FrameError::BufferTooSmall {
                expected: STATUS_RESPONSE_LEN,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let ctrl = cursor.read_u8()?;
        if ctrl != CTRL_DONE {
            return Err(FrameError::ControlStatus(ctrl));
        }
        let status = cursor.read_u8()?;
        let poll_timeout_ms = cursor.read_u24::<LittleEndian>()?;
        let state = DfuState::from_u8(cursor.read_u8()?);
        Ok(Self {
            status,
            poll_timeout_ms,
            state,
        })
    }

    pub fn to_bytes(&self) -> [u8; STATUS_RESPONSE_LEN] {
        let t = self.poll_timeout_ms.to_le_bytes();
        [CTRL_DONE, self.status, t[0], t[1], t[2], self.state.as_u8()]
    }

    pub fn is_error(&self) -> bool {
        self.state == DfuState::Error || self.status != DFU_STATUS_OK
    }
}

/// Parse `ctrl major minor patch`.
pub fn parse_version(data: &[u8]) -> Result<Version, FrameError> {
    if data.len() < VERSION_RESPONSE_LEN {
        return Err(FrameError::BufferTooSmall {
            expected: VERSION_RESPONSE_LEN,
            actual: data.len(),
        });
    }
    let mut cursor = Cursor::new(data);
    let ctrl = cursor.read_u8()?;
    if ctrl != CTRL_DONE {
        return Err(FrameError::ControlStatus(ctrl));
    }
    Ok(Version::new(
        cursor.read_u8()?,
        cursor.read_u8()?,
        cursor.read_u8()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        // 0x000102 ms little-endian, dfuDNLOAD-IDLE
        let status = DeviceStatus::from_bytes(&[0, 0, 0x02, 0x01, 0x00, 5]).unwrap();
        assert_eq!(status.poll_timeout_ms, 0x0102);
        assert_eq!(status.state, DfuState::DnloadIdle);
        assert!(status.state.is_ready());
        assert!(!status.is_error());
    }

    #[test]
    fn test_status_control_error() {
        assert!(matches!(
            DeviceStatus::from_bytes(&[1, 0, 0, 0, 0, 2]),
            Err(FrameError::ControlStatus(1))
        ));
    }

    #[test]
    fn test_status_short_buffer() {
        assert!(matches!(
            DeviceStatus::from_bytes(&[0, 0, 0]),
            Err(FrameError::BufferTooSmall {
                expected: 6,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_status_bytes_match_wire() {
        let status = DeviceStatus {
            status: 0,
            poll_timeout_ms: 0x030201,
            state: DfuState::DnBusy,
        };
        assert_eq!(status.to_bytes(), [0, 0, 0x01, 0x02, 0x03, 4]);
        assert_eq!(DeviceStatus::from_bytes(&status.to_bytes()).unwrap(), status);
    }

    #[test]
    fn test_ready_states() {
        assert!(DfuState::from_u8(2).is_ready());
        assert!(DfuState::from_u8(5).is_ready());
        assert!(DfuState::from_u8(8).is_ready());
        assert!(!DfuState::from_u8(4).is_ready());
        assert!(!DfuState::from_u8(10).is_ready());
        assert_eq!(DfuState::from_u8(42), DfuState::Unknown(42));
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(parse_version(&[0, 1, 1, 3]).unwrap(), Version::new(1, 1, 3));
        assert!(parse_version(&[0xFF, 1, 1, 3]).is_err());
    }
}
