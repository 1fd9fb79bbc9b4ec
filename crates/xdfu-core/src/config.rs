//! Build-time configuration.
//!
//! Everything here runs on the host before the device program exists. A
//! failure is a `ConfigError` that stops the build; none of these checks are
//! repeated on the device.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::image::{FirmwareImage, Md5Digest, Version};
use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("md5 is not consistent with file contents: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Malformed md5 digest {0:?}: expected 32 hex characters")]
    MalformedDigest(String),

    #[error("Malformed version {0:?}: expected major.minor.patch")]
    MalformedVersion(String),

    #[error("Firmware image is empty")]
    EmptyImage,

    #[error("I2C address 0x{0:02X} outside 0x08..=0x77")]
    InvalidAddress(u8),

    #[error("Chunk size {size} outside 1..={max}")]
    InvalidChunkSize { size: usize, max: usize },

    #[error("Retry attempts must be at least 1")]
    InvalidRetry,

    #[error("Unsupported firmware source {0:?}")]
    InvalidUrl(String),

    #[error("Could not open firmware file {path}: {source}")]
    FirmwareFile {
        path: String,
        source: std::io::Error,
    },

    #[error("Firmware download failed: {0}")]
    Download(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Bounded retry of a single bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries per operation, including the first.
    pub attempts: u8,
    /// Sleep between tries.
    pub backoff_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Validated, immutable device parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    pub address: u8,
    /// GPIO number of the reset line, for diagnostics.
    pub reset_pin: u8,
    pub chunk_size: usize,
    pub boot_delay_ms: u32,
    pub ready_timeout_ms: u32,
    pub version_poll_interval_ms: u32,
    pub version_poll_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            reset_pin: 0,
            chunk_size: MAX_XFER,
            boot_delay_ms: DEFAULT_BOOT_DELAY_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            version_poll_interval_ms: DEFAULT_VERSION_POLL_INTERVAL_MS,
            version_poll_attempts: DEFAULT_VERSION_POLL_ATTEMPTS,
            retry: RetryPolicy::default(),
        }
    }
}

impl DeviceSettings {
    /// Check ranges. `max_chunk` is the transport's block limit.
    pub fn validate(&self, max_chunk: usize) -> Result<(), ConfigError> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&self.address) {
            return Err(ConfigError::InvalidAddress(self.address));
        }
        if self.chunk_size == 0 || self.chunk_size > max_chunk {
            return Err(ConfigError::InvalidChunkSize {
                size: self.chunk_size,
                max: max_chunk,
            });
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::InvalidRetry);
        }
        Ok(())
    }
}

/// `[firmware]` table as written by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirmwareConfig {
    /// `http(s)://`, `file://` or a filesystem path.
    pub url: String,
    pub version: String,
    pub md5: String,
}

/// `[firmware]` after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSpec {
    pub source: FirmwareSource,
    pub version: Version,
    pub md5: Md5Digest,
}

/// Where the firmware bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareSource {
    Http(String),
    Local(String),
}

impl FirmwareSource {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(FirmwareSource::Http(url.to_string()));
        }
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(ConfigError::InvalidUrl(url.to_string()));
            }
            return Ok(FirmwareSource::Local(path.to_string()));
        }
        if url.is_empty() || url.contains("://") {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }
        Ok(FirmwareSource::Local(url.to_string()))
    }

    /// The string the cache key is derived from.
    pub fn as_str(&self) -> &str {
        match self {
            FirmwareSource::Http(url) | FirmwareSource::Local(url) => url,
        }
    }
}

impl FirmwareSpec {
    /// Verify `bytes` against the declared digest.
    pub fn image(&self, bytes: impl Into<Cow<'static, [u8]>>) -> Result<FirmwareImage, ConfigError> {
        FirmwareImage::verified(bytes, self.version, &self.md5)
    }
}

fn default_address() -> u8 {
    DEFAULT_ADDRESS
}
fn default_chunk_size() -> usize {
    MAX_XFER
}
fn default_boot_delay_ms() -> u32 {
    DEFAULT_BOOT_DELAY_MS
}
fn default_ready_timeout_ms() -> u32 {
    DEFAULT_READY_TIMEOUT_MS
}
fn default_version_poll_interval_ms() -> u32 {
    DEFAULT_VERSION_POLL_INTERVAL_MS
}
fn default_version_poll_attempts() -> u32 {
    DEFAULT_VERSION_POLL_ATTEMPTS
}

/// Device configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default = "default_address")]
    pub address: u8,
    pub reset_pin: u8,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_boot_delay_ms")]
    pub boot_delay_ms: u32,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u32,
    #[serde(default = "default_version_poll_interval_ms")]
    pub version_poll_interval_ms: u32,
    #[serde(default = "default_version_poll_attempts")]
    pub version_poll_attempts: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub firmware: Option<FirmwareConfig>,
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            address: self.address,
            reset_pin: self.reset_pin,
            chunk_size: self.chunk_size,
            boot_delay_ms: self.boot_delay_ms,
            ready_timeout_ms: self.ready_timeout_ms,
            version_poll_interval_ms: self.version_poll_interval_ms,
            version_poll_attempts: self.version_poll_attempts,
            retry: self.retry,
        }
    }

    /// Validate the whole file. Returns the firmware spec when one is declared.
    pub fn validate(&self) -> Result<(DeviceSettings, Option<FirmwareSpec>), ConfigError> {
        let settings = self.settings();
        settings.validate(MAX_XFER)?;
        let firmware = match &self.firmware {
            Some(fw) => Some(FirmwareSpec {
                source: FirmwareSource::parse(&fw.url)?,
                version: fw.version.parse()?,
                md5: Md5Digest::from_hex(&fw.md5)?,
            }),
            None => None,
        };
        Ok((settings, firmware))
    }
}

/// Result of [`configure`].
#[derive(Debug, Clone)]
pub struct Configured {
    pub settings: DeviceSettings,
    pub image: FirmwareImage,
}

/// Validate the parameters of one device and its firmware image.
///
/// Fails on an out-of-range address, a malformed version or digest string,
/// an empty image, or a digest that does not match the bytes.
pub fn configure(
    reset_pin: u8,
    address: u8,
    firmware: impl Into<Cow<'static, [u8]>>,
    version: &str,
    digest: &str,
) -> Result<Configured, ConfigError> {
    let settings = DeviceSettings {
        address,
        reset_pin,
        ..DeviceSettings::default()
    };
    settings.validate(MAX_XFER)?;
    let version: Version = version.parse()?;
    let digest = Md5Digest::from_hex(digest)?;
    let image = FirmwareImage::verified(firmware, version, &digest)?;
    info!(
        address = %format!("0x{:02X}", address),
        version = %version,
        size = image.len(),
        "Firmware configured"
    );
    Ok(Configured { settings, image })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    #[test]
    fn test_configure_accepts_matching_digest() {
        let configured = configure(4, 0x42, &b"hello"[..], "1.1.0", HELLO_MD5).unwrap();
        assert_eq!(configured.settings.address, 0x42);
        assert_eq!(configured.settings.reset_pin, 4);
        assert_eq!(configured.image.version(), Version::new(1, 1, 0));
    }

    #[test]
    fn test_configure_rejects_padded_deadbeef() {
        let digest = format!("{:0<32}", "deadbeef");
        let err = configure(4, 0x42, &b"hello"[..], "1.1.0", &digest).unwrap_err();
        assert!(matches!(err, ConfigError::DigestMismatch { .. }));
    }

    #[test]
    fn test_configure_rejects_bad_version_and_address() {
        assert!(matches!(
            configure(4, 0x42, &b"hello"[..], "1.1", HELLO_MD5),
            Err(ConfigError::MalformedVersion(_))
        ));
        assert!(matches!(
            configure(4, 0x7F, &b"hello"[..], "1.1.0", HELLO_MD5),
            Err(ConfigError::InvalidAddress(0x7F))
        ));
    }

    #[test]
    fn test_settings_validate_chunk_size() {
        let mut settings = DeviceSettings::default();
        settings.chunk_size = 0;
        assert!(settings.validate(128).is_err());
        settings.chunk_size = 129;
        assert!(matches!(
            settings.validate(128),
            Err(ConfigError::InvalidChunkSize { size: 129, max: 128 })
        ));
        settings.chunk_size = 64;
        assert!(settings.validate(128).is_ok());
        settings.retry.attempts = 0;
        assert!(matches!(settings.validate(128), Err(ConfigError::InvalidRetry)));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = DeviceConfig::from_toml_str("reset_pin = 4\n").unwrap();
        let (settings, firmware) = config.validate().unwrap();
        assert_eq!(settings, DeviceSettings {
            reset_pin: 4,
            ..DeviceSettings::default()
        });
        assert!(firmware.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = DeviceConfig::from_toml_str(&format!(
            r#"
            address = 0x43
            reset_pin = 5
            chunk_size = 64
            [retry]
            attempts = 5
            [firmware]
            url = "https://example.com/fw.bin"
            version = "1.0.9"
            md5 = "{HELLO_MD5}"
            "#
        ))
        .unwrap();
        let (settings, firmware) = config.validate().unwrap();
        assert_eq!(settings.address, 0x43);
        assert_eq!(settings.retry.attempts, 5);
        assert_eq!(settings.retry.backoff_ms, DEFAULT_RETRY_BACKOFF_MS);
        let firmware = firmware.unwrap();
        assert_eq!(
            firmware.source,
            FirmwareSource::Http("https://example.com/fw.bin".into())
        );
        assert_eq!(firmware.version, Version::new(1, 0, 9));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            DeviceConfig::from_toml_str("reset_pin = 4\nmute_state = true\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_short_md5_rejected() {
        let config = DeviceConfig::from_toml_str(
            r#"
            reset_pin = 4
            [firmware]
            url = "fw.bin"
            version = "1.0.0"
            md5 = "abc"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MalformedDigest(_))));
    }

    #[test]
    fn test_firmware_source_parse() {
        assert_eq!(
            FirmwareSource::parse("file:///tmp/fw.bin").unwrap(),
            FirmwareSource::Local("/tmp/fw.bin".into())
        );
        assert_eq!(
            FirmwareSource::parse("fw.bin").unwrap(),
            FirmwareSource::Local("fw.bin".into())
        );
        assert!(FirmwareSource::parse("ftp://host/fw.bin").is_err());
        assert!(FirmwareSource::parse("").is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        let config = DeviceConfig::from_toml_str("reset_pin = 7\nchunk_size = 32\n").unwrap();
        config.save_to_file(&path).unwrap();
        let loaded = DeviceConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.settings(), config.settings());
    }
}
