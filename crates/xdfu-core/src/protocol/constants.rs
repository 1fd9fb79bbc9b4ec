//! Protocol constants for the XMOS device-control DFU servicer.
//!
//! Requests are framed as `[resource_id, command_id, payload_len, payload..]`.
//! Read commands set the top bit of the command id and are followed by a bus
//! read whose first byte is the control status.

// ============================================================================
// Bus
// ============================================================================

/// Default 7-bit I2C address of the audio front-end.
pub const DEFAULT_ADDRESS: u8 = 0x42;

/// Lowest non-reserved 7-bit address.
pub const MIN_ADDRESS: u8 = 0x08;
/// Highest non-reserved 7-bit address.
pub const MAX_ADDRESS: u8 = 0x77;

// ============================================================================
// Resources and commands
// ============================================================================

/// DFU controller servicer resource id.
pub const DFU_CONTROLLER_SERVICER_RESID: u8 = 240;

pub const DFU_CMD_DETACH: u8 = 0;
pub const DFU_CMD_DNLOAD: u8 = 1;
pub const DFU_CMD_UPLOAD: u8 = 2;
pub const DFU_CMD_GETSTATUS: u8 = 3;
pub const DFU_CMD_CLRSTATUS: u8 = 4;
pub const DFU_CMD_GETSTATE: u8 = 5;
pub const DFU_CMD_ABORT: u8 = 6;
pub const DFU_CMD_SETALTERNATE: u8 = 64;
pub const DFU_CMD_TRANSFERBLOCK: u8 = 65;
pub const DFU_CMD_GETVERSION: u8 = 88;
pub const DFU_CMD_REBOOT: u8 = 89;

/// Set on a command id to request a read.
pub const DFU_COMMAND_READ_BIT: u8 = 0x80;

/// Alternate setting selecting the upgrade partition (0 is the factory image).
pub const DFU_ALTERNATE_UPGRADE: u8 = 1;

/// Control status byte of a successful read.
pub const CTRL_DONE: u8 = 0;

// ============================================================================
// Sizes
// ============================================================================

/// Maximum payload bytes per DNLOAD request.
pub const MAX_XFER: usize = 128;

/// DNLOAD payload length field: data plus the 2-byte length prefix.
pub const DNLOAD_PAYLOAD_LEN: u8 = (MAX_XFER + 2) as u8;

/// Bytes written for one DNLOAD request (header + length + data).
pub const DNLOAD_FRAME_LEN: usize = 3 + 2 + MAX_XFER;

/// GETSTATUS response length.
pub const STATUS_RESPONSE_LEN: usize = 6;

/// GETVERSION response length.
pub const VERSION_RESPONSE_LEN: usize = 4;

// ============================================================================
// DFU states (USB DFU 1.1 numbering, as reported by the servicer)
// ============================================================================

pub const DFU_STATE_APP_IDLE: u8 = 0;
pub const DFU_STATE_APP_DETACH: u8 = 1;
pub const DFU_STATE_IDLE: u8 = 2;
pub const DFU_STATE_DNLOAD_SYNC: u8 = 3;
pub const DFU_STATE_DNBUSY: u8 = 4;
pub const DFU_STATE_DNLOAD_IDLE: u8 = 5;
pub const DFU_STATE_MANIFEST_SYNC: u8 = 6;
pub const DFU_STATE_MANIFEST: u8 = 7;
pub const DFU_STATE_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_STATE_UPLOAD_IDLE: u8 = 9;
pub const DFU_STATE_ERROR: u8 = 10;

/// `bStatus` value for "no error".
pub const DFU_STATUS_OK: u8 = 0;

// ============================================================================
// Timing defaults
// ============================================================================

/// Time the peripheral needs to boot after a reset pulse.
pub const DEFAULT_BOOT_DELAY_MS: u32 = 3000;

/// Reset line hold time.
pub const RESET_PULSE_MS: u32 = 1;

/// Maximum time without a ready status before the transfer is abandoned.
pub const DEFAULT_READY_TIMEOUT_MS: u32 = 1000;

/// Interval between version reads while waiting for the rebooted image.
pub const DEFAULT_VERSION_POLL_INTERVAL_MS: u32 = 500;

/// Version reads attempted after REBOOT before giving up.
pub const DEFAULT_VERSION_POLL_ATTEMPTS: u32 = 20;

/// Bus retry defaults.
pub const DEFAULT_RETRY_ATTEMPTS: u8 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u32 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnload_frame_matches_wire_layout() {
        assert_eq!(DNLOAD_PAYLOAD_LEN, 130);
        assert_eq!(DNLOAD_FRAME_LEN, 133);
    }

    #[test]
    fn read_commands_have_top_bit() {
        assert_eq!(DFU_CMD_GETSTATUS | DFU_COMMAND_READ_BIT, 0x83);
        assert_eq!(DFU_CMD_GETVERSION | DFU_COMMAND_READ_BIT, 0xD8);
    }
}
