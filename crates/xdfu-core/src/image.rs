//! Firmware image store.
//!
//! An image is fixed when the device program is built: the bytes live in
//! static storage, and the declared MD5 digest has already been checked
//! against them. Host tools construct the same type from owned bytes.

use md5::{Digest, Md5};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// Firmware version triple as reported by the peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// A zero version means the peripheral has not reported one yet.
    pub fn is_valid(&self) -> bool {
        self.major != 0 || self.minor != 0 || self.patch != 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::MalformedVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u8, ConfigError> {
            let part = parts.next().ok_or_else(malformed)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            part.parse::<u8>().map_err(|_| malformed())
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(version)
    }
}

/// MD5 digest of an image.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    pub const HEX_LEN: usize = 32;

    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    /// Parse a 32-character hex digest (either case).
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s.len() != Self::HEX_LEN {
            return Err(ConfigError::MalformedDigest(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| ConfigError::MalformedDigest(s.to_string()))?;
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&bytes);
        Ok(Self(digest))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5Digest({})", self.to_hex())
    }
}

/// Verified firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    bytes: Cow<'static, [u8]>,
    version: Version,
    digest: Md5Digest,
}

impl FirmwareImage {
    /// Check `bytes` against `expected` and build the image.
    pub fn verified(
        bytes: impl Into<Cow<'static, [u8]>>,
        version: Version,
        expected: &Md5Digest,
    ) -> Result<Self, ConfigError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ConfigError::EmptyImage);
        }
        let actual = Md5Digest::compute(&bytes);
        if actual != *expected {
            return Err(ConfigError::DigestMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(Self {
            bytes,
            version,
            digest: actual,
        })
    }

    /// Image embedded in the device program, as emitted by the bundler.
    pub fn from_static(
        bytes: &'static [u8],
        version: Version,
        md5_hex: &str,
    ) -> Result<Self, ConfigError> {
        Self::verified(bytes, version, &Md5Digest::from_hex(md5_hex)?)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn digest(&self) -> &Md5Digest {
        &self.digest
    }

    /// Up to `max_len` bytes starting at `offset`; empty past the end.
    pub fn chunk(&self, offset: usize, max_len: usize) -> &[u8] {
        let start = offset.min(self.bytes.len());
        let end = start.saturating_add(max_len).min(self.bytes.len());
        &self.bytes[start..end]
    }
}
