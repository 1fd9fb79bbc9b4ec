//! I2C transport for the XMOS DFU servicer.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use tracing::{debug, instrument, trace, warn};

use super::traits::{Ack, DfuTransport, TransportError, Verification};
use crate::config::{DeviceSettings, RetryPolicy};
use crate::image::Version;
use crate::protocol::constants::{DFU_ALTERNATE_UPGRADE, MAX_XFER, RESET_PULSE_MS};
use crate::protocol::{DeviceStatus, DfuState, Request, parse_version};

/// Transport over an `embedded-hal` I2C bus with a reset line.
#[derive(Debug)]
pub struct I2cTransport<I, P, D> {
    i2c: I,
    reset_pin: P,
    delay: D,
    address: u8,
    retry: RetryPolicy,
    boot_delay_ms: u32,
    ready_timeout_ms: u32,
    /// Delay requested by the last status read.
    poll_delay_ms: u32,
    /// Offset the next chunk must start at.
    next_offset: usize,
}

impl<I, P, D> I2cTransport<I, P, D>
where
    I: I2c,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(i2c: I, reset_pin: P, delay: D, settings: &DeviceSettings) -> Self {
        Self {
            i2c,
            reset_pin,
            delay,
            address: settings.address,
            retry: settings.retry,
            boot_delay_ms: settings.boot_delay_ms,
            ready_timeout_ms: settings.ready_timeout_ms,
            poll_delay_ms: 0,
            next_offset: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn is_transient(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::NoAcknowledge(_) | ErrorKind::ArbitrationLoss | ErrorKind::Bus
        )
    }

    /// Run `op` until it succeeds, a non-transient error occurs, or the
    /// retry budget is spent.
    fn with_retry<R>(
        &mut self,
        name: &'static str,
        mut op: impl FnMut(&mut I, u8) -> Result<R, I::Error>,
    ) -> Result<R, TransportError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(&mut self.i2c, self.address) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let kind = e.kind();
                    if !Self::is_transient(kind) {
                        return Err(TransportError::Bus { op: name, kind });
                    }
                    if attempt >= attempts {
                        return Err(TransportError::RetriesExhausted {
                            op: name,
                            attempts,
                            kind,
                        });
                    }
                    warn!(op = name, attempt, error = %kind, "Transient bus error, retrying");
                    self.delay.delay_ms(self.retry.backoff_ms);
                    attempt += 1;
                }
            }
        }
    }

    fn send(&mut self, request: Request<'_>) -> Result<(), TransportError> {
        let frame = request.encode()?;
        trace!(request = request.name(), len = frame.len(), "TX");
        self.with_retry(request.name(), |i2c, address| i2c.write(address, &frame))
    }

    fn query(&mut self, request: Request<'_>) -> Result<Vec<u8>, TransportError> {
        let frame = request.encode()?;
        let len = request.response_len().unwrap_or(0);
        trace!(request = request.name(), len = frame.len(), "TX");
        let response = self.with_retry(request.name(), |i2c, address| {
            i2c.write(address, &frame)?;
            let mut buf = vec![0u8; len];
            i2c.read(address, &mut buf)?;
            Ok(buf)
        })?;
        trace!(request = request.name(), data = ?response, "RX");
        Ok(response)
    }

    /// Poll status until the servicer is ready for the next request.
    fn wait_ready(&mut self, op: &'static str) -> Result<DeviceStatus, TransportError> {
        let mut waited: u32 = 0;
        loop {
            self.pause(&mut waited)?;
            let status = self.read_status()?;
            if status.is_error() {
                return Err(TransportError::Rejected {
                    op,
                    state: status.state,
                    status: status.status,
                });
            }
            if status.state.is_ready() {
                return Ok(status);
            }
            // Always let time pass between polls
            self.poll_delay_ms = self.poll_delay_ms.max(1);
        }
    }

    /// Sleep for the delay the peripheral asked for, capped by what is left
    /// of the ready timeout. Fails once the budget is spent.
    fn pause(&mut self, waited: &mut u32) -> Result<(), TransportError> {
        if self.poll_delay_ms == 0 {
            return Ok(());
        }
        let remaining = self.ready_timeout_ms.saturating_sub(*waited);
        if remaining == 0 {
            return Err(TransportError::Timeout {
                timeout_ms: self.ready_timeout_ms,
            });
        }
        let ms = self.poll_delay_ms.min(remaining);
        if ms < self.poll_delay_ms {
            debug!(
                requested_ms = self.poll_delay_ms,
                ms, "Poll delay capped by ready timeout"
            );
        }
        self.delay.delay_ms(ms);
        *waited = waited.saturating_add(ms);
        Ok(())
    }
}

impl<I, P, D> DfuTransport for I2cTransport<I, P, D>
where
    I: I2c,
    P: OutputPin,
    D: DelayNs,
{
    fn max_chunk_size(&self) -> usize {
        MAX_XFER
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        debug!(boot_delay_ms = self.boot_delay_ms, "Pulsing reset line");
        self.reset_pin
            .set_high()
            .map_err(|e| TransportError::ResetLine(format!("{e:?}")))?;
        self.delay.delay_ms(RESET_PULSE_MS);
        self.reset_pin
            .set_low()
            .map_err(|e| TransportError::ResetLine(format!("{e:?}")))?;
        self.delay.delay_ms(self.boot_delay_ms);
        self.poll_delay_ms = 0;
        self.next_offset = 0;
        Ok(())
    }

    #[instrument(skip(self), fields(address = %format!("0x{:02X}", self.address)))]
    fn enter_bootloader(&mut self) -> Result<(), TransportError> {
        self.reset()?;
        self.send(Request::SetAlternate(DFU_ALTERNATE_UPGRADE))?;
        let status = self.wait_ready("SETALTERNATE")?;
        debug!(state = %status.state, "Peripheral in DFU mode");
        Ok(())
    }

    fn write_chunk(&mut self, offset: usize, data: &[u8]) -> Result<Ack, TransportError> {
        if data.is_empty() || data.len() > MAX_XFER {
            return Err(TransportError::ChunkSize {
                len: data.len(),
                max: MAX_XFER,
            });
        }
        if offset != self.next_offset {
            return Err(TransportError::OutOfSequence {
                offset,
                expected: self.next_offset,
            });
        }
        self.wait_ready("DNLOAD")?;
        self.send(Request::Dnload(data))?;
        let status = self.read_status()?;
        if status.is_error() {
            return Err(TransportError::Rejected {
                op: "DNLOAD",
                state: status.state,
                status: status.status,
            });
        }
        self.next_offset += data.len();
        Ok(Ack {
            state: status.state,
            poll_timeout_ms: status.poll_timeout_ms,
        })
    }

    fn read_status(&mut self) -> Result<DeviceStatus, TransportError> {
        let response = self.query(Request::GetStatus)?;
        let status = DeviceStatus::from_bytes(&response)?;
        self.poll_delay_ms = status.poll_timeout_ms;
        trace!(
            state = %status.state,
            status = status.status,
            poll_timeout_ms = status.poll_timeout_ms,
            "DFU status"
        );
        Ok(status)
    }

    fn finish_download(&mut self) -> Result<(), TransportError> {
        self.wait_ready("DNLOAD(final)")?;
        self.send(Request::DnloadFinal)
    }

    fn verify(&mut self) -> Result<Verification, TransportError> {
        let mut waited: u32 = 0;
        loop {
            self.pause(&mut waited)?;
            let status = self.read_status()?;
            if status.is_error() {
                return Ok(Verification::Failed {
                    state: status.state,
                    status: status.status,
                });
            }
            match status.state {
                DfuState::ManifestWaitReset | DfuState::Idle => return Ok(Verification::Passed),
                DfuState::AppIdle | DfuState::AppDetach | DfuState::UploadIdle => {
                    return Err(TransportError::UnexpectedState(status.state));
                }
                _ => {}
            }
            self.poll_delay_ms = self.poll_delay_ms.max(1);
        }
    }

    fn commit(&mut self) -> Result<(), TransportError> {
        self.send(Request::Reboot)?;
        self.next_offset = 0;
        self.poll_delay_ms = 0;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.send(Request::Abort) {
            warn!(error = %e, "ABORT request failed, resetting anyway");
        }
        // The upgrade partition was never committed, so a reset boots the old image
        self.reset()
    }

    fn read_version(&mut self) -> Result<Version, TransportError> {
        let response = self.query(Request::GetVersion)?;
        Ok(parse_version(&response)?)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockPeripheral;

    fn transport(
        peripheral: &MockPeripheral,
    ) -> I2cTransport<
        crate::transport::mock::MockBus,
        crate::transport::mock::MockResetPin,
        crate::transport::mock::MockDelay,
    > {
        let settings = DeviceSettings {
            boot_delay_ms: 10,
            ..DeviceSettings::default()
        };
        I2cTransport::new(
            peripheral.bus(),
            peripheral.reset_pin(),
            peripheral.delay(),
            &settings,
        )
    }

    #[test]
    fn test_enter_bootloader_selects_upgrade_partition() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        assert!(peripheral.in_dfu_mode());
        assert_eq!(peripheral.reset_count(), 1);
        assert_eq!(peripheral.alternate(), Some(DFU_ALTERNATE_UPGRADE));
    }

    #[test]
    fn test_write_chunk_requires_sequence() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 16]).unwrap();
        assert!(matches!(
            t.write_chunk(0, &[1; 16]),
            Err(TransportError::OutOfSequence {
                offset: 0,
                expected: 16
            })
        ));
        t.write_chunk(16, &[2; 16]).unwrap();
        assert_eq!(peripheral.received().len(), 32);
    }

    #[test]
    fn test_write_chunk_rejects_oversized() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        assert!(matches!(
            t.write_chunk(0, &[0; MAX_XFER + 1]),
            Err(TransportError::ChunkSize { .. })
        ));
        assert!(matches!(
            t.write_chunk(0, &[]),
            Err(TransportError::ChunkSize { len: 0, .. })
        ));
    }

    #[test]
    fn test_transient_nack_is_retried() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        peripheral.nack_next(2);
        t.write_chunk(0, &[7; 8]).unwrap();
        assert_eq!(peripheral.received(), vec![7; 8]);
    }

    #[test]
    fn test_retries_exhausted() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        peripheral.nack_next(10);
        assert!(matches!(
            t.write_chunk(0, &[7; 8]),
            Err(TransportError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_busy_peripheral_is_polled_until_ready() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        peripheral.busy_polls(3);
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        t.write_chunk(8, &[2; 8]).unwrap();
        assert_eq!(peripheral.received().len(), 16);
    }

    #[test]
    fn test_busy_past_timeout() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        peripheral.busy_polls(10_000);
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        assert!(matches!(
            t.write_chunk(8, &[2; 8]),
            Err(TransportError::Timeout { timeout_ms: 1000 })
        ));
    }

    #[test]
    fn test_long_poll_delay_is_capped_by_ready_timeout() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        peripheral.busy_polls(u32::MAX);
        peripheral.busy_poll_ms(0xFF_FFFF);
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        let before = peripheral.elapsed_ms();
        assert!(matches!(
            t.write_chunk(8, &[2; 8]),
            Err(TransportError::Timeout { timeout_ms: 1000 })
        ));
        assert!(peripheral.elapsed_ms() - before <= 1000);
    }

    #[test]
    fn test_verify_wait_is_bounded() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        t.finish_download().unwrap();
        // Peripheral asks for the longest wait it can encode
        t.poll_delay_ms = 0xFF_FFFF;
        let before = peripheral.elapsed_ms();
        assert!(matches!(
            t.verify(),
            Err(TransportError::Timeout { timeout_ms: 1000 })
        ));
        assert_eq!(peripheral.elapsed_ms() - before, 1000);
    }

    #[test]
    fn test_verify_and_commit() {
        let peripheral =
            MockPeripheral::new(Version::new(1, 0, 0)).with_update_version(Version::new(1, 1, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        t.finish_download().unwrap();
        assert_eq!(t.verify().unwrap(), Verification::Passed);
        t.commit().unwrap();
        assert!(!peripheral.in_dfu_mode());
        assert_eq!(t.read_version().unwrap(), Version::new(1, 1, 0));
    }

    #[test]
    fn test_verify_failure() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        peripheral.corrupt_image();
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        t.finish_download().unwrap();
        assert!(matches!(t.verify().unwrap(), Verification::Failed { .. }));
    }

    #[test]
    fn test_abort_reboots_previous_image() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let mut t = transport(&peripheral);
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
        t.abort().unwrap();
        assert!(!peripheral.in_dfu_mode());
        assert!(peripheral.received().is_empty());
        assert_eq!(t.read_version().unwrap(), Version::new(1, 0, 0));
        // Offsets restart after an abort
        t.enter_bootloader().unwrap();
        t.write_chunk(0, &[1; 8]).unwrap();
    }

    #[test]
    fn test_wrong_address_is_not_acknowledged() {
        let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
        let settings = DeviceSettings {
            address: 0x43,
            boot_delay_ms: 0,
            ..DeviceSettings::default()
        };
        let mut t = I2cTransport::new(
            peripheral.bus(),
            peripheral.reset_pin(),
            peripheral.delay(),
            &settings,
        );
        assert!(matches!(
            t.read_version(),
            Err(TransportError::RetriesExhausted { op: "GETVERSION", .. })
        ));
    }
}
