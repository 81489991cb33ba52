// hds-local-store/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use hds_local_store::{config::Config, metrics, telemetry, LocalDataService, SystemClock};
#[cfg(feature = "cli")]
use std::path::PathBuf;
#[cfg(feature = "cli")]
use std::sync::Arc;
#[cfg(feature = "cli")]
use tracing::info;

/// Runs the local data service until Ctrl-C.
#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "hds-local-store", version, about)]
struct Cli {
    /// Overrides HDS_DB_PATH.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Overrides HDS_SWEEP_INTERVAL_MINUTES.
    #[arg(long)]
    sweep_interval: Option<u32>,

    /// Keep everything in memory (demo mode).
    #[arg(long)]
    demo: bool,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing();
    metrics::init_metrics()?;

    let mut cfg = Config::from_env()?;
    if let Some(db_path) = cli.db_path {
        cfg.db_path = db_path;
    }
    if let Some(minutes) = cli.sweep_interval {
        cfg.sweep_interval_minutes = minutes;
    }
    cfg.validate()?;
    cfg.print_config();

    let service = if cli.demo {
        info!("Starting in demo mode; nothing is persisted");
        LocalDataService::in_memory(&cfg, Arc::new(SystemClock))?
    } else {
        LocalDataService::from_config(&cfg)?
    };
    service.start_automatic_cleanup();
    info!("Local data service running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    service.shutdown().await;

    info!("Final metrics:\n{}", metrics::render()?);
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
