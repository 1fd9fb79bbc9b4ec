//! Firmware fetch and cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use xdfu_core::{FirmwareImage, FirmwareSource, FirmwareSpec};

/// Default cache location for downloaded images.
pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("xdfu")
}

/// Cache file name for `url`: the first 8 hex characters of its SHA-256.
pub fn cache_key(url: &str) -> String {
    hex::encode(&Sha256::digest(url.as_bytes())[..4])
}

/// Resolve the firmware bytes for `spec` and verify them.
///
/// Relative paths are taken relative to `base_dir`, the directory of the
/// configuration file. HTTP downloads are cached in `cache_dir`. `refresh`
/// skips the cache; a cached file that fails verification is downloaded
/// again once.
pub fn fetch_firmware(
    spec: &FirmwareSpec,
    base_dir: &Path,
    cache_dir: &Path,
    refresh: bool,
) -> Result<FirmwareImage> {
    fetch_with(spec, base_dir, cache_dir, refresh, download_http)
}

fn fetch_with<F>(
    spec: &FirmwareSpec,
    base_dir: &Path,
    cache_dir: &Path,
    refresh: bool,
    mut download: F,
) -> Result<FirmwareImage>
where
    F: FnMut(&str, &Path) -> Result<()>,
{
    let image = match &spec.source {
        FirmwareSource::Local(path) => {
            let path = base_dir.join(path);
            debug!(path = %path.display(), "Reading local firmware");
            let bytes = fs::read(&path)
                .with_context(|| format!("Could not read firmware file {}", path.display()))?;
            spec.image(bytes)
                .with_context(|| format!("Firmware {} failed verification", path.display()))?
        }
        FirmwareSource::Http(url) => {
            let cached = cache_dir.join(cache_key(url));
            let fresh = refresh || !cached.exists();
            if fresh {
                download(url, &cached)?;
            } else {
                info!(path = %cached.display(), "Using cached firmware");
            }
            match spec.image(read_cached(&cached)?) {
                Ok(image) => image,
                Err(e) if !fresh => {
                    warn!(path = %cached.display(), error = %e, "Cached firmware is stale, downloading again");
                    download(url, &cached)?;
                    spec.image(read_cached(&cached)?).with_context(|| {
                        format!("Firmware {} failed verification", cached.display())
                    })?
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Firmware {} failed verification", cached.display())
                    });
                }
            }
        }
    };

    info!(
        version = %image.version(),
        size = image.len(),
        md5 = %image.digest(),
        "Firmware verified"
    );
    Ok(image)
}

fn read_cached(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Could not read cached firmware {}", path.display()))
}

fn download_http(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context("Failed to create cache directory")?;
    }
    info!(url, "Downloading firmware");

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;
    let response = client.get(url).send().context("Failed to start download")?;
    if !response.status().is_success() {
        bail!("HTTP error: {}", response.status());
    }
    let body = response.bytes().context("Failed to read response body")?;

    // Write beside the target and rename, so an interrupted download never
    // leaves a truncated file under the cache key
    let partial = dest.with_extension("part");
    fs::write(&partial, &body).context("Failed to write firmware")?;
    fs::rename(&partial, dest).context("Failed to move firmware into cache")?;
    info!(bytes = body.len(), path = %dest.display(), "Download complete");
    Ok(())
}
