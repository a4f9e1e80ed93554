//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mediagate_service::config::Config;
use mediagate_service::logging;
use mediagate_service::MediaGateway;

/// mediagate commands.
#[derive(Subcommand)]
enum Command {
    /// Print cache statistics as JSON.
    Status,
    /// Remove every cached video and thumbnail.
    Clear,
    /// Validate the configuration file and exit.
    CheckConfig,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(name = "mediagate", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: Called before any other thread is spawned.
    unsafe { logging::init_logging(&config) };

    match cli.command {
        Command::Status => status(config),
        Command::Clear => clear(config),
        Command::CheckConfig => {
            println!("configuration ok");
            Ok(())
        }
    }
}

fn status(config: Config) -> Result<()> {
    let gateway = MediaGateway::new(config).context("failed to create the gateway")?;
    let status = gateway.cache_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn clear(config: Config) -> Result<()> {
    let gateway = MediaGateway::new(config).context("failed to create the gateway")?;
    let outcome = gateway.clear_cache().context("failed to clear caches")?;
    println!("cache cleared: {} files removed", outcome.removed_files);
    Ok(())
}
