//! Property-based tests for chunking and progress reporting.
//! Every session runs against the simulated peripheral.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use xdfu_core::{
    DeviceBuilder, DfuEngine, FirmwareImage, Md5Digest, MockPeripheral, SessionOutcome, Version,
};

const OLD: Version = Version::new(1, 0, 0);
const NEW: Version = Version::new(1, 1, 0);

fn flash(bytes: Vec<u8>, chunk_size: usize) -> (SessionOutcome, Vec<f32>, MockPeripheral) {
    let peripheral = MockPeripheral::new(OLD).with_update_version(NEW);
    let digest = Md5Digest::compute(&bytes);
    let device = DeviceBuilder::new()
        .chunk_size(chunk_size)
        .firmware(FirmwareImage::verified(bytes, NEW, &digest).unwrap())
        .build_i2c(peripheral.bus(), peripheral.reset_pin(), peripheral.delay())
        .unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let mut engine = DfuEngine::new(device);
    let seen = Arc::clone(&progress);
    engine.on_progress(move |fraction| {
        seen.lock().unwrap().push(fraction);
        Ok(())
    });

    let outcome = engine.flash().unwrap();
    let progress = progress.lock().unwrap().clone();
    (outcome, progress, peripheral)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// One progress event per chunk, ending at exactly 1.0.
    #[test]
    fn progress_events_match_chunk_count(
        bytes in proptest::collection::vec(any::<u8>(), 1..1200),
        chunk_size in 1usize..=128,
    ) {
        let len = bytes.len();
        let (outcome, progress, peripheral) = flash(bytes.clone(), chunk_size);

        prop_assert_eq!(outcome, SessionOutcome::Completed);
        prop_assert_eq!(progress.len(), len.div_ceil(chunk_size));
        prop_assert_eq!(progress.last().copied(), Some(1.0));
        prop_assert!(progress.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(progress.iter().all(|p| *p > 0.0 && *p <= 1.0));
        prop_assert_eq!(peripheral.running_version(), NEW);
        prop_assert!(!peripheral.in_dfu_mode());
    }

    /// Digest parsing ignores case and always agrees with the computed digest.
    #[test]
    fn digest_hex_is_case_insensitive(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let digest = Md5Digest::compute(&bytes);
        let lower = digest.to_hex();
        prop_assert_eq!(Md5Digest::from_hex(&lower).unwrap(), digest);
        prop_assert_eq!(Md5Digest::from_hex(&lower.to_uppercase()).unwrap(), digest);
        prop_assert_eq!(Md5Digest::compute(&bytes), digest);
    }

    /// Any digest string that is not 32 hex characters is rejected.
    #[test]
    fn short_digest_rejected(hex in "[0-9a-f]{0,31}") {
        prop_assert!(Md5Digest::from_hex(&hex).is_err());
    }
}
