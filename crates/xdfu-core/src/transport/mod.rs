//! Transport layer module.

pub mod i2c;
pub mod mock;
pub mod traits;

pub use i2c::I2cTransport;
pub use mock::{MockBus, MockDelay, MockPeripheral, MockResetPin};
pub use traits::{Ack, DfuTransport, TransportError, Verification};

/// Transport wired to a [`MockPeripheral`].
pub type MockTransport = I2cTransport<MockBus, MockResetPin, MockDelay>;
