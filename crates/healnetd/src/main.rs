//! healnet daemon - self-healing network monitor
//!
//! Polls configured devices, opens issues for anomalies, runs remediation and
//! retrains the detector from resolutions.

use anyhow::{Context, Result};
use clap::Parser;
use healnet_common::config::CONFIG_PATH;
use healnet_common::{Config, VERSION};
use healnetd::persistence::{JsonPersistence, MemoryPersistence, Persistence};
use healnetd::remediation::CommandExecutor;
use healnetd::telemetry::{SimulatedSource, TcpProbeSource, TelemetrySource};
use healnetd::HealDaemon;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "healnetd")]
#[command(about = "Self-healing network monitor", long_about = None)]
#[command(version = VERSION)]
struct Args {
    /// Config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Validate the config and exit
    #[arg(long)]
    check_config: bool,

    /// Run a single tick, print the network status and exit
    #[arg(long)]
    once: bool,

    /// Keep all state in memory
    #[arg(long)]
    in_memory: bool,

    /// Use synthetic telemetry with this seed instead of probing devices
    #[arg(long, value_name = "SEED")]
    simulate: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config)
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    if args.check_config {
        println!("{}: OK ({} devices)", args.config.display(), config.devices.len());
        return Ok(());
    }

    info!("healnetd v{} starting", VERSION);

    let source: Arc<dyn TelemetrySource> = match args.simulate {
        Some(seed) => {
            info!("Using simulated telemetry (seed {})", seed);
            Arc::new(SimulatedSource::new(seed))
        }
        None => Arc::new(TcpProbeSource::new(&config.devices)),
    };
    let persistence: Arc<dyn Persistence> = match (&config.storage.state_dir, args.in_memory) {
        (Some(dir), false) => {
            info!("State directory: {}", dir.display());
            Arc::new(JsonPersistence::new(dir.clone()))
        }
        _ => {
            info!("Keeping state in memory");
            Arc::new(MemoryPersistence::new())
        }
    };
    let executor = Arc::new(CommandExecutor::from_config(&config.remediation));

    let daemon = HealDaemon::new(config, source, executor, persistence).await?;

    if args.once {
        let report = daemon.tick().await;
        info!(
            "Polled {} devices ({} unreachable), {} candidate anomalies",
            report.polled, report.unreachable, report.candidates
        );
        let status = daemon.service().network_status().await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run(shutdown_rx).await;
    info!("Shutting down gracefully");
    Ok(())
}
