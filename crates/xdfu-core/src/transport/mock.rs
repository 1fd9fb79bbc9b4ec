//! Simulated peripheral for testing.
//!
//! `MockPeripheral` models the DFU servicer of the audio front-end behind the
//! `embedded-hal` traits, so the real `I2cTransport` runs unmodified against
//! it. The bus, reset line and delay handles share one state.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use crate::image::Version;
use crate::protocol::constants::*;
use crate::protocol::{DeviceStatus, DfuState};

/// Poll timeout reported while busy.
const BUSY_POLL_MS: u32 = 5;
/// Status polls spent in manifestation after the final block.
const MANIFEST_POLLS: u32 = 2;

#[derive(Debug)]
struct PeripheralState {
    address: u8,
    running_version: Version,
    update_version: Version,
    /// Overrides `update_version` after a successful reboot.
    reboot_version: Option<Version>,
    dfu_mode: bool,
    dfu_state: DfuState,
    dfu_status: u8,
    alternate: Option<u8>,
    received: Vec<u8>,
    chunks: usize,
    pending_read: Option<Vec<u8>>,
    reset_asserted: bool,
    reset_count: u32,
    elapsed_ns: u64,
    writes: Vec<Vec<u8>>,
    // Faults
    nack_next: u32,
    nack_from_chunk: Option<usize>,
    busy_polls: u32,
    busy_poll_ms: u32,
    busy_remaining: u32,
    manifest_remaining: u32,
    corrupt: bool,
    unresponsive: bool,
}

impl PeripheralState {
    fn reboot(&mut self) {
        self.dfu_mode = false;
        self.dfu_state = DfuState::AppIdle;
        self.dfu_status = DFU_STATUS_OK;
        self.alternate = None;
        self.received.clear();
        self.chunks = 0;
        self.pending_read = None;
        self.busy_remaining = 0;
        self.manifest_remaining = 0;
    }

    fn responds(&self, address: u8) -> bool {
        address == self.address && !self.unresponsive && !self.reset_asserted
    }

    fn handle_write(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        self.writes.push(bytes.to_vec());
        if bytes.len() < 3 || bytes[0] != DFU_CONTROLLER_SERVICER_RESID {
            return Ok(());
        }
        match bytes[1] {
            cmd if cmd == DFU_CMD_GETSTATUS | DFU_COMMAND_READ_BIT => {
                let status = self.poll_status();
                self.pending_read = Some(status.to_bytes().to_vec());
            }
            cmd if cmd == DFU_CMD_GETVERSION | DFU_COMMAND_READ_BIT => {
                let v = self.running_version;
                self.pending_read = Some(vec![CTRL_DONE, v.major, v.minor, v.patch]);
            }
            DFU_CMD_SETALTERNATE => {
                self.alternate = bytes.get(3).copied();
                self.dfu_mode = true;
                self.dfu_state = DfuState::Idle;
                self.dfu_status = DFU_STATUS_OK;
                self.received.clear();
                self.chunks = 0;
            }
            DFU_CMD_DNLOAD => self.handle_dnload(bytes)?,
            DFU_CMD_ABORT => {
                if self.dfu_mode {
                    self.dfu_state = DfuState::Idle;
                    self.received.clear();
                    self.chunks = 0;
                }
            }
            DFU_CMD_REBOOT => {
                if self.dfu_mode && self.dfu_state == DfuState::ManifestWaitReset {
                    self.running_version = self.reboot_version.unwrap_or(self.update_version);
                }
                self.reboot();
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_dnload(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        if !self.dfu_mode || bytes.len() < 5 {
            self.dfu_state = DfuState::Error;
            self.dfu_status = 0x0F; // errSTALLEDPKT
            return Ok(());
        }
        let len = u16::from_le_bytes([bytes[3], bytes[4]]) as usize;
        if len == 0 {
            if self.corrupt {
                self.dfu_state = DfuState::Error;
                self.dfu_status = 0x07; // errVERIFY
            } else {
                self.dfu_state = DfuState::ManifestSync;
                self.manifest_remaining = MANIFEST_POLLS;
            }
            return Ok(());
        }
        if let Some(k) = self.nack_from_chunk
            && self.chunks >= k
        {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
        }
        let end = (5 + len).min(bytes.len());
        self.received.extend_from_slice(&bytes[5..end]);
        self.chunks += 1;
        if self.busy_polls > 0 {
            self.dfu_state = DfuState::DnBusy;
            self.busy_remaining = self.busy_polls;
        } else {
            self.dfu_state = DfuState::DnloadIdle;
        }
        Ok(())
    }

    /// Status as reported by one GETSTATUS, advancing busy/manifest phases.
    fn poll_status(&mut self) -> DeviceStatus {
        let mut poll_timeout_ms = 0;
        match self.dfu_state {
            DfuState::DnBusy => {
                if self.busy_remaining == 0 {
                    self.dfu_state = DfuState::DnloadIdle;
                } else {
                    self.busy_remaining -= 1;
                    poll_timeout_ms = self.busy_poll_ms;
                }
            }
            DfuState::ManifestSync => {
                if self.manifest_remaining == 0 {
                    self.dfu_state = DfuState::ManifestWaitReset;
                } else {
                    self.manifest_remaining -= 1;
                    poll_timeout_ms = BUSY_POLL_MS;
                }
            }
            _ => {}
        }
        DeviceStatus {
            status: self.dfu_status,
            poll_timeout_ms,
            state: self.dfu_state,
        }
    }
}

/// Shared handle to a simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    state: Arc<Mutex<PeripheralState>>,
}

impl MockPeripheral {
    /// A peripheral at the default address running `running_version`.
    pub fn new(running_version: Version) -> Self {
        Self {
            state: Arc::new(Mutex::new(PeripheralState {
                address: DEFAULT_ADDRESS,
                running_version,
                update_version: running_version,
                reboot_version: None,
                dfu_mode: false,
                dfu_state: DfuState::AppIdle,
                dfu_status: DFU_STATUS_OK,
                alternate: None,
                received: Vec::new(),
                chunks: 0,
                pending_read: None,
                reset_asserted: false,
                reset_count: 0,
                elapsed_ns: 0,
                writes: Vec::new(),
                nack_next: 0,
                nack_from_chunk: None,
                busy_polls: 0,
                busy_poll_ms: BUSY_POLL_MS,
                busy_remaining: 0,
                manifest_remaining: 0,
                corrupt: false,
                unresponsive: false,
            })),
        }
    }

    /// Version reported after a transferred image is committed.
    pub fn with_update_version(self, version: Version) -> Self {
        self.lock().update_version = version;
        self
    }

    pub fn with_address(self, address: u8) -> Self {
        self.lock().address = address;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bus(&self) -> MockBus {
        MockBus {
            state: Arc::clone(&self.state),
        }
    }

    pub fn reset_pin(&self) -> MockResetPin {
        MockResetPin {
            state: Arc::clone(&self.state),
        }
    }

    pub fn delay(&self) -> MockDelay {
        MockDelay {
            state: Arc::clone(&self.state),
        }
    }

    // Fault injection

    /// NACK the next `n` bus transactions.
    pub fn nack_next(&self, n: u32) {
        self.lock().nack_next = n;
    }

    /// NACK every DNLOAD carrying data once `k` chunks have been accepted.
    pub fn nack_from_chunk(&self, k: usize) {
        self.lock().nack_from_chunk = Some(k);
    }

    /// Report busy for `n` polls after each chunk.
    pub fn busy_polls(&self, n: u32) {
        self.lock().busy_polls = n;
    }

    /// Poll timeout reported by each busy status, up to 24 bits.
    pub fn busy_poll_ms(&self, ms: u32) {
        self.lock().busy_poll_ms = ms;
    }

    /// Fail the integrity check after the final block.
    pub fn corrupt_image(&self) {
        self.lock().corrupt = true;
    }

    /// Boot `version` instead of the update version after commit.
    pub fn reboot_into(&self, version: Version) {
        self.lock().reboot_version = Some(version);
    }

    /// Stop acknowledging any address.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    // Inspection

    pub fn in_dfu_mode(&self) -> bool {
        self.lock().dfu_mode
    }

    pub fn running_version(&self) -> Version {
        self.lock().running_version
    }

    pub fn alternate(&self) -> Option<u8> {
        self.lock().alternate
    }

    /// Image bytes received in the current DFU session.
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    pub fn chunks_received(&self) -> usize {
        self.lock().chunks
    }

    pub fn reset_count(&self) -> u32 {
        self.lock().reset_count
    }

    /// Simulated time spent in delays.
    pub fn elapsed_ms(&self) -> u64 {
        self.lock().elapsed_ns / 1_000_000
    }

    /// Every frame written to the bus.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }
}

/// I2C side of a [`MockPeripheral`].
#[derive(Debug)]
pub struct MockBus {
    state: Arc<Mutex<PeripheralState>>,
}

impl ErrorType for MockBus {
    type Error = ErrorKind;
}

impl I2c for MockBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.responds(address) {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        if state.nack_next > 0 {
            state.nack_next -= 1;
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
        }
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => state.handle_write(bytes)?,
                Operation::Read(buf) => {
                    let data = state.pending_read.take().ok_or(ErrorKind::Other)?;
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                }
            }
        }
        Ok(())
    }
}

/// Reset line of a [`MockPeripheral`]. High holds the peripheral in reset.
#[derive(Debug)]
pub struct MockResetPin {
    state: Arc<Mutex<PeripheralState>>,
}

impl PinErrorType for MockResetPin {
    type Error = Infallible;
}

impl OutputPin for MockResetPin {
    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reset_asserted = true;
        state.reboot();
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.reset_asserted {
            state.reset_count += 1;
        }
        state.reset_asserted = false;
        Ok(())
    }
}

/// Delay source of a [`MockPeripheral`]; advances simulated time only.
#[derive(Debug)]
pub struct MockDelay {
    state: Arc<Mutex<PeripheralState>>,
}

impl MockDelay {
    fn advance(&mut self, ns: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.elapsed_ns = state.elapsed_ns.saturating_add(ns);
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.advance(u64::from(ns));
    }

    fn delay_us(&mut self, us: u32) {
        self.advance(u64::from(us) * 1_000);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.advance(u64::from(ms) * 1_000_000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_version_query() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 5));
        let mut bus = peripheral.bus();
        bus.write(DEFAULT_ADDRESS, &[0xF0, 0xD8, 4]).unwrap();
        let mut buf = [0u8; 4];
        bus.read(DEFAULT_ADDRESS, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 0, 5]);
    }

    #[test]
    fn test_mock_read_without_request_fails() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut buf = [0u8; 4];
        assert_eq!(
            peripheral.bus().read(DEFAULT_ADDRESS, &mut buf),
            Err(ErrorKind::Other)
        );
    }

    #[test]
    fn test_mock_nack_next() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        peripheral.nack_next(1);
        let mut bus = peripheral.bus();
        assert!(bus.write(DEFAULT_ADDRESS, &[0xF0, 0xD8, 4]).is_err());
        assert!(bus.write(DEFAULT_ADDRESS, &[0xF0, 0xD8, 4]).is_ok());
    }

    #[test]
    fn test_mock_reset_leaves_dfu_mode() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        peripheral
            .bus()
            .write(DEFAULT_ADDRESS, &[0xF0, 0x40, 1, 1])
            .unwrap();
        assert!(peripheral.in_dfu_mode());
        let mut pin = peripheral.reset_pin();
        pin.set_high().unwrap();
        assert!(peripheral.bus().write(DEFAULT_ADDRESS, &[0xF0, 0xD8, 4]).is_err());
        pin.set_low().unwrap();
        assert!(!peripheral.in_dfu_mode());
        assert_eq!(peripheral.reset_count(), 1);
    }

    #[test]
    fn test_mock_delay_advances_time() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut delay = peripheral.delay();
        delay.delay_ms(3);
        delay.delay_us(500);
        delay.delay_us(500);
        assert_eq!(peripheral.elapsed_ms(), 4);
    }
}
