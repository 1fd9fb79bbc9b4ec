//! Firmware update against a simulated peripheral.

use anyhow::{Result, bail};
use tracing::info;
use xdfu_core::{
    DeviceBuilder, DeviceSettings, DfuEngine, DfuEvent, DfuObserver, FirmwareImage,
    MockPeripheral, SessionOutcome, SetupOutcome, Version,
};

/// Version a simulated peripheral runs unless told otherwise.
const FACTORY_VERSION: Version = Version::new(1, 0, 0);

/// Faults injected into the simulated peripheral.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Version the peripheral runs before the update.
    pub running: Option<Version>,
    /// NACK every block from this chunk on.
    pub fail_at_chunk: Option<usize>,
    /// Fail the peripheral's integrity check.
    pub corrupt: bool,
    /// Transient NACKs at the start of the session.
    pub nacks: u32,
    /// Busy status polls after each block.
    pub busy: u32,
}

/// Prints events to stdout.
struct PrintObserver;

impl DfuObserver for PrintObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Start => println!("start"),
            DfuEvent::Progress(fraction) => println!("progress {:5.1}%", fraction * 100.0),
            DfuEvent::End => println!("end"),
            DfuEvent::Error(code) => println!("error {} ({})", code.as_u8(), code),
        }
    }
}

/// Start the simulated device the way the device program does: reset, read
/// the version and update when it differs from `image`.
pub fn run(settings: DeviceSettings, image: FirmwareImage, faults: &Faults) -> Result<()> {
    let target = image.version();
    let running = faults.running.unwrap_or(if target == FACTORY_VERSION {
        Version::new(0, 9, 0)
    } else {
        FACTORY_VERSION
    });

    let peripheral = MockPeripheral::new(running)
        .with_update_version(target)
        .with_address(settings.address);
    if let Some(k) = faults.fail_at_chunk {
        peripheral.nack_from_chunk(k);
    }
    if faults.corrupt {
        peripheral.corrupt_image();
    }
    if faults.busy > 0 {
        peripheral.busy_polls(faults.busy);
    }

    let device = DeviceBuilder::new()
        .settings(settings)
        .firmware(image)
        .build_i2c(peripheral.bus(), peripheral.reset_pin(), peripheral.delay())?;
    let mut engine = DfuEngine::new(device);
    engine.subscribe(Box::new(PrintObserver));

    match engine.setup()? {
        SetupOutcome::UpToDate(version) => {
            println!("firmware {version} already running");
            return Ok(());
        }
        SetupOutcome::NoFirmware(version) => {
            println!("firmware {version} running, nothing bundled");
            return Ok(());
        }
        SetupOutcome::UpdateStarted { running, target } => {
            println!("updating {running} -> {target}");
        }
    }

    // Transient faults start once the device has been reached
    if faults.nacks > 0 {
        peripheral.nack_next(faults.nacks);
    }

    let outcome = engine.run_to_completion();
    info!(
        simulated_ms = peripheral.elapsed_ms(),
        resets = peripheral.reset_count(),
        "Simulation finished"
    );
    match outcome {
        Some(SessionOutcome::Completed) | None => {
            println!("peripheral now runs {}", peripheral.running_version());
            Ok(())
        }
        Some(SessionOutcome::Failed(code)) => {
            println!("peripheral still runs {}", peripheral.running_version());
            bail!("Update failed: {code}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xdfu_core::Md5Digest;

    fn image() -> FirmwareImage {
        let bytes = vec![0x11; 300];
        let digest = Md5Digest::compute(&bytes);
        FirmwareImage::verified(bytes, Version::new(1, 1, 0), &digest).unwrap()
    }

    #[test]
    fn test_clean_run() {
        run(DeviceSettings::default(), image(), &Faults::default()).unwrap();
    }

    #[test]
    fn test_up_to_date() {
        let faults = Faults {
            running: Some(Version::new(1, 1, 0)),
            ..Faults::default()
        };
        run(DeviceSettings::default(), image(), &faults).unwrap();
    }

    #[test]
    fn test_injected_failure_is_reported() {
        let faults = Faults {
            fail_at_chunk: Some(1),
            ..Faults::default()
        };
        let err = run(DeviceSettings::default(), image(), &faults).unwrap_err();
        assert!(err.to_string().contains("communication error"));
    }

    #[test]
    fn test_corrupt_image() {
        let faults = Faults {
            corrupt: true,
            ..Faults::default()
        };
        let err = run(DeviceSettings::default(), image(), &faults).unwrap_err();
        assert!(err.to_string().contains("verification failed"));
    }
}
