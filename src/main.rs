use anyhow::Result;
use asset_sync::cli::{run, Cli, Outcome};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(Outcome::Clean) => std::process::exit(0),
        Ok(Outcome::Degraded) => std::process::exit(2),
        Err(e) => {
            tracing::error!(error = %e, "asset-sync failed");
            std::process::exit(1);
        }
    }
}
