use crate::load_config::load_config;
use crate::synchronise::{cleanup_asset_cache, synchronise, SynchroniseReport};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI for asset-sync: incremental content ingestion with local asset copies.
#[derive(Parser)]
#[clap(
    name = "asset-sync",
    version,
    about = "Synchronise externally authored content and its expiring assets into durable local copies"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronise every changed item using the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Ignore the sync cache and rebuild every item
        #[clap(long)]
        force: bool,
    },
    /// Drop asset cache records whose stored file is missing
    CacheCleanup {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// What the process should report back to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    /// The run completed but some items failed or still hold broken references.
    Degraded,
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<Outcome> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config, force } => {
            let mut config = load_config(config)?;
            config.force |= force;
            println!("Synchronise starting...");
            match synchronise(&config).await {
                Ok(report) => {
                    print_report(&report);
                    Ok(if report.is_clean() {
                        Outcome::Clean
                    } else {
                        Outcome::Degraded
                    })
                }
                Err(e) => {
                    eprintln!("[ERROR] Synchronisation failed: {}", e);
                    Err(anyhow::Error::new(e))
                }
            }
        }
        Commands::CacheCleanup { config } => {
            let config = load_config(config)?;
            let removed = cleanup_asset_cache(&config)?;
            println!("Removed {removed} stale asset cache record(s).");
            Ok(Outcome::Clean)
        }
    }
}

fn print_report(report: &SynchroniseReport) {
    println!("Synchronise complete ({}).", report.mode);
    println!(
        "  items: {} listed, {} processed, {} skipped, {} deleted",
        report.listed, report.processed, report.skipped, report.deleted
    );
    println!(
        "  results: {} succeeded, {} failed, {} still broken",
        report.succeeded, report.failed, report.still_broken
    );
    println!(
        "  assets: {} downloaded, {} cache hits, {} bytes saved",
        report.downloads, report.cache_hits, report.bytes_saved
    );
}
