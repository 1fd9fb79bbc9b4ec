//! Rust source generation for bundled firmware.
//!
//! The device program embeds its image as a static byte array. `Bundle`
//! renders that array together with the version, digest and bus settings, so
//! the device program only has to `include!` the file.

use std::fmt;
use std::path::Path;

use tracing::info;

use crate::config::{ConfigError, DeviceSettings};
use crate::image::FirmwareImage;

const BYTES_PER_LINE: usize = 16;

/// A verified image and its device settings, rendered as a Rust module.
pub struct Bundle<'a> {
    image: &'a FirmwareImage,
    settings: &'a DeviceSettings,
    crate_name: &'a str,
}

impl<'a> Bundle<'a> {
    pub fn new(image: &'a FirmwareImage, settings: &'a DeviceSettings) -> Self {
        Self {
            image,
            settings,
            crate_name: "xdfu_core",
        }
    }

    /// Path the generated code uses to reach this crate.
    pub fn crate_name(mut self, name: &'a str) -> Self {
        self.crate_name = name;
        self
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_string())?;
        info!(
            path = %path.display(),
            size = self.image.len(),
            version = %self.image.version(),
            "Firmware bundle written"
        );
        Ok(())
    }
}

impl fmt::Display for Bundle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self.image.version();
        let krate = self.crate_name;

        writeln!(f, "// @generated by `xdfu bundle`. Do not edit.")?;
        writeln!(f)?;
        writeln!(f, "use {krate}::config::ConfigError;")?;
        writeln!(f, "use {krate}::image::{{FirmwareImage, Version}};")?;
        writeln!(f)?;
        writeln!(f, "pub const ADDRESS: u8 = 0x{:02X};", self.settings.address)?;
        writeln!(f, "pub const RESET_PIN: u8 = {};", self.settings.reset_pin)?;
        writeln!(
            f,
            "pub const FIRMWARE_VERSION: Version = Version::new({}, {}, {});",
            version.major, version.minor, version.patch
        )?;
        writeln!(
            f,
            "pub const FIRMWARE_MD5: &str = \"{}\";",
            self.image.digest().to_hex()
        )?;
        writeln!(f)?;

        writeln!(f, "pub static FIRMWARE_BIN: [u8; {}] = [", self.image.len())?;
        for line in self.image.bytes().chunks(BYTES_PER_LINE) {
            write!(f, "   ")?;
            for byte in line {
                write!(f, " 0x{byte:02X},")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "];")?;
        writeln!(f)?;

        writeln!(
            f,
            "pub fn firmware_image() -> Result<FirmwareImage, ConfigError> {{"
        )?;
        writeln!(
            f,
            "    FirmwareImage::from_static(&FIRMWARE_BIN, FIRMWARE_VERSION, FIRMWARE_MD5)"
        )?;
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Md5Digest, Version};

    fn image(bytes: &[u8]) -> FirmwareImage {
        FirmwareImage::verified(bytes.to_vec(), Version::new(1, 1, 0), &Md5Digest::compute(bytes))
            .unwrap()
    }

    #[test]
    fn test_render_module() {
        let image = image(b"hello");
        let settings = DeviceSettings {
            reset_pin: 4,
            ..DeviceSettings::default()
        };
        let source = Bundle::new(&image, &settings).to_string();

        assert!(source.contains("pub const ADDRESS: u8 = 0x42;"));
        assert!(source.contains("pub const RESET_PIN: u8 = 4;"));
        assert!(source.contains("Version::new(1, 1, 0)"));
        assert!(source.contains("\"5d41402abc4b2a76b9719d911017c592\""));
        assert!(source.contains("pub static FIRMWARE_BIN: [u8; 5] = ["));
        assert!(source.contains("    0x68, 0x65, 0x6C, 0x6C, 0x6F,\n"));
        assert!(source.contains("use xdfu_core::image::{FirmwareImage, Version};"));
    }

    #[test]
    fn test_line_wrapping() {
        let image = image(&[0u8; 40]);
        let settings = DeviceSettings::default();
        let source = Bundle::new(&image, &settings).crate_name("fw").to_string();
        let rows = source.lines().filter(|l| l.starts_with("    0x")).count();
        assert_eq!(rows, 3);
        assert!(source.contains("use fw::config::ConfigError;"));
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.rs");
        let image = image(b"abc");
        let settings = DeviceSettings::default();
        Bundle::new(&image, &settings).write_to(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[u8; 3]"));
    }
}
