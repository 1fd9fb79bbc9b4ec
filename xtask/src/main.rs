use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run all tests, with and without event listeners
    Test,
    /// Run the simulator on a configuration file
    Simulate {
        config: String,
        /// Extra arguments for `xdfu simulate`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Testing project...");
            cargo(&["test", "--workspace"], "Test")?;
            println!("Testing xdfu-core without state-callback...");
            cargo(
                &["test", "-p", "xdfu-core", "--no-default-features", "--lib"],
                "Test (no listeners)",
            )?;
        }
        Commands::Simulate { config, args } => {
            println!("Simulating update...");
            let mut cmd: Vec<&str> = vec!["run", "-p", "xdfu-cli", "--", "simulate", config];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Simulation")?;
        }
    }

    Ok(())
}
