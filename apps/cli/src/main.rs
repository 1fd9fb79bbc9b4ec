mod fetch;
mod simulate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use xdfu_core::{Bundle, DeviceConfig, DeviceSettings, FirmwareSpec, Version};

#[derive(Parser, Debug)]
#[command(author, version, about = "XMOS audio front-end firmware tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Where downloaded firmware is cached.
#[derive(Args, Debug)]
struct CacheArgs {
    /// Cache directory for downloads
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Download again even when a cached copy exists
    #[arg(long)]
    refresh: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a device configuration file
    Validate {
        /// Path to the TOML configuration
        config: PathBuf,
    },
    /// Download and verify the configured firmware
    Fetch {
        config: PathBuf,
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Write the verified firmware as a Rust module
    Bundle {
        config: PathBuf,
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
        #[command(flatten)]
        cache: CacheArgs,
        /// Crate path used by the generated code
        #[arg(long, default_value = "xdfu_core")]
        crate_name: String,
    },
    /// Run an update against a simulated peripheral
    Simulate {
        config: PathBuf,
        #[command(flatten)]
        cache: CacheArgs,
        /// Version the peripheral runs before the update (x.y.z)
        #[arg(long)]
        running: Option<String>,
        /// NACK every block from this chunk on
        #[arg(long)]
        fail_at_chunk: Option<usize>,
        /// Fail the peripheral's integrity check
        #[arg(long)]
        corrupt: bool,
        /// Transient NACKs to inject
        #[arg(long, default_value_t = 0)]
        nacks: u32,
        /// Busy polls after each block
        #[arg(long, default_value_t = 0)]
        busy: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Could not install logger: {e}");
    }

    if let Err(e) = run(cli.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Validate { config } => {
            let (settings, firmware) = load(&config)?;
            println!("{}: ok", config.display());
            println!("  address:    0x{:02X}", settings.address);
            println!("  reset pin:  {}", settings.reset_pin);
            println!("  chunk size: {}", settings.chunk_size);
            if let Some(fw) = firmware {
                println!("  firmware:   {} ({})", fw.version, fw.source.as_str());
                println!("  md5:        {}", fw.md5);
            }
            Ok(())
        }
        Commands::Fetch { config, cache } => {
            let (_, firmware) = load(&config)?;
            let image = fetch(&config, firmware, cache)?;
            println!(
                "firmware {} verified ({} bytes, md5 {})",
                image.version(),
                image.len(),
                image.digest()
            );
            Ok(())
        }
        Commands::Bundle {
            config,
            out,
            cache,
            crate_name,
        } => {
            let (settings, firmware) = load(&config)?;
            let image = fetch(&config, firmware, cache)?;
            Bundle::new(&image, &settings)
                .crate_name(&crate_name)
                .write_to(&out)
                .with_context(|| format!("Could not write {}", out.display()))?;
            println!("wrote {}", out.display());
            Ok(())
        }
        Commands::Simulate {
            config,
            cache,
            running,
            fail_at_chunk,
            corrupt,
            nacks,
            busy,
        } => {
            let (settings, firmware) = load(&config)?;
            let image = fetch(&config, firmware, cache)?;
            let running = running
                .map(|v| v.parse::<Version>())
                .transpose()
                .context("Invalid --running version")?;
            let faults = simulate::Faults {
                running,
                fail_at_chunk,
                corrupt,
                nacks,
                busy,
            };
            simulate::run(settings, image, &faults)
        }
    }
}

fn load(path: &Path) -> Result<(DeviceSettings, Option<FirmwareSpec>)> {
    let config = DeviceConfig::load_from_file(path)
        .with_context(|| format!("Could not load {}", path.display()))?;
    let validated = config
        .validate()
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    info!(path = %path.display(), "Configuration valid");
    Ok(validated)
}

fn fetch(
    config: &Path,
    firmware: Option<FirmwareSpec>,
    cache: CacheArgs,
) -> Result<xdfu_core::FirmwareImage> {
    let Some(spec) = firmware else {
        bail!("{} has no [firmware] table", config.display());
    };
    let base_dir = config.parent().unwrap_or_else(|| Path::new("."));
    let cache_dir = cache.cache_dir.unwrap_or_else(fetch::default_cache_dir);
    fetch::fetch_firmware(&spec, base_dir, &cache_dir, cache.refresh)
}
