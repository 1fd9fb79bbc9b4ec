//! Device handle and its builder.
//!
//! A `DeviceHandle` binds one peripheral: the transport that reaches it, the
//! validated settings and, optionally, the firmware image bundled for it.
//! It is immutable once built.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;
use tracing::debug;

use crate::config::{ConfigError, Configured, DeviceSettings};
use crate::image::FirmwareImage;
use crate::transport::{DfuTransport, I2cTransport};

/// Builder for [`DeviceHandle`].
#[derive(Debug, Clone, Default)]
pub struct DeviceBuilder {
    settings: DeviceSettings,
    image: Option<FirmwareImage>,
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the output of [`crate::config::configure`].
    pub fn configured(configured: Configured) -> Self {
        Self {
            settings: configured.settings,
            image: Some(configured.image),
        }
    }

    pub fn settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn reset_pin(mut self, pin: u8) -> Self {
        self.settings.reset_pin = pin;
        self
    }

    pub fn address(mut self, address: u8) -> Self {
        self.settings.address = address;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.settings.chunk_size = chunk_size;
        self
    }

    pub fn firmware(mut self, image: FirmwareImage) -> Self {
        self.image = Some(image);
        self
    }

    /// Bind the settings to an already constructed transport.
    pub fn build<T: DfuTransport>(self, transport: T) -> Result<DeviceHandle<T>, ConfigError> {
        self.settings.validate(transport.max_chunk_size())?;
        debug!(
            address = %format!("0x{:02X}", self.settings.address),
            reset_pin = self.settings.reset_pin,
            chunk_size = self.settings.chunk_size,
            firmware = ?self.image.as_ref().map(|i| i.version()),
            "Device built"
        );
        Ok(DeviceHandle {
            transport,
            settings: self.settings,
            image: self.image,
        })
    }

    /// Build an I2C transport from the settings and bind it.
    pub fn build_i2c<I, P, D>(
        self,
        i2c: I,
        reset_pin: P,
        delay: D,
    ) -> Result<DeviceHandle<I2cTransport<I, P, D>>, ConfigError>
    where
        I: I2c,
        P: OutputPin,
        D: DelayNs,
    {
        let transport = I2cTransport::new(i2c, reset_pin, delay, &self.settings);
        self.build(transport)
    }
}

/// One peripheral and the image bound to it.
#[derive(Debug)]
pub struct DeviceHandle<T: DfuTransport> {
    transport: T,
    settings: DeviceSettings,
    image: Option<FirmwareImage>,
}

impl<T: DfuTransport> DeviceHandle<T> {
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Split borrows for the state machine.
    pub(crate) fn parts_mut(&mut self) -> (&mut T, &DeviceSettings, Option<&FirmwareImage>) {
        (&mut self.transport, &self.settings, self.image.as_ref())
    }
}
