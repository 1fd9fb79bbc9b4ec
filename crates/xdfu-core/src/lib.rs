//! xdfu-core: firmware update engine for XMOS audio front-ends.
//!
//! Updates the voice processor of a ReSpeaker Lite class board over I2C,
//! speaking the XMOS device-control DFU servicer protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Image**: firmware bytes, version and MD5 digest
//! - **Protocol**: wire constants, request frames, status decoding
//! - **Transport**: `DfuTransport` over `embedded-hal` I2C, plus a simulated peripheral
//! - **State**: DFU state machine and phase handlers
//! - **Events**: per-kind listeners for start, progress, end and error
//! - **Session**: the engine that owns a device and its session
//! - **Action**: the flash trigger, cooperative or blocking
//! - **Config / Codegen**: build-time validation and firmware bundling
//!
//! # Example
//!
//! ```no_run
//! use xdfu_core::{DeviceBuilder, DfuEngine, FlashAction, MockPeripheral, Version, configure};
//!
//! # fn main() -> anyhow::Result<()> {
//! let configured = configure(4, 0x42, &b"hello"[..], "1.1.0", "5d41402abc4b2a76b9719d911017c592")?;
//! let peripheral = MockPeripheral::new(Version::new(1, 0, 0));
//! let device = DeviceBuilder::configured(configured)
//!     .build_i2c(peripheral.bus(), peripheral.reset_pin(), peripheral.delay())?;
//!
//! let mut engine = DfuEngine::new(device);
//! engine.on_progress(|fraction| {
//!     println!("{:.0}%", fraction * 100.0);
//!     Ok(())
//! });
//! let engine = engine.into_shared();
//! FlashAction::new(engine.clone()).play()?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod codegen;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod image;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use action::{ExecutionMode, FlashAction, flash};
pub use codegen::Bundle;
pub use config::{
    ConfigError, Configured, DeviceConfig, DeviceSettings, FirmwareSource, FirmwareSpec,
    RetryPolicy, configure,
};
pub use device::{DeviceBuilder, DeviceHandle};
pub use error::{DfuError, ErrorCode};
pub use events::{DfuEvent, DfuObserver, EventBus, EventKind, NullObserver, TracingObserver};
pub use image::{FirmwareImage, Md5Digest, Version};
pub use session::{DfuEngine, SetupOutcome, SharedEngine};
pub use state::{DfuPhase, SessionOutcome};
pub use transport::{
    DfuTransport, I2cTransport, MockPeripheral, MockTransport, TransportError, Verification,
};
