//! HDV Watcher binary: config load, tracing init, pipeline lifecycle,
//! housekeeping ticks, ctrl-c shutdown.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hdv_watcher::capture::list_devices;
use hdv_watcher::health::HealthStatus;
use hdv_watcher::{Config, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "hdv-watcher", about = "Auction-house price sniffer")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "HDV_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Capture interface name (overrides config)
    #[arg(long)]
    interface: Option<String>,

    /// Game TCP port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Print available capture interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if cli.list_interfaces {
        for line in list_devices().context("enumerate capture devices")? {
            println!("{}", line);
        }
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref()).context("load configuration")?;
    if let Some(db) = cli.db {
        config.storage.path = db;
    }
    if let Some(interface) = cli.interface {
        config.capture.interface = Some(interface);
    }
    if let Some(port) = cli.port {
        config.capture.port = port;
    }
    config.validate().context("validate configuration")?;

    info!(
        port = config.capture.port,
        interface = config.capture.interface.as_deref().unwrap_or("auto"),
        db = %config.storage.path,
        "hdv_watcher_starting"
    );

    let pipeline = Pipeline::new(&config)?;
    pipeline.start()?;

    let mut monitor = tokio::time::interval(Duration::from_secs(5));
    let mut health_tick = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
            _ = monitor.tick() => {
                pipeline.queue().report_utilisation();
                // Under heavy pressure, throw the worker pool at the backlog
                if pipeline.queue().utilisation() >= 0.95 {
                    pipeline.processing().spawn_drain();
                }
                if pipeline.capture_failed() {
                    error!("capture_loop_died");
                }
            }
            _ = health_tick.tick() => {
                let report = pipeline.health();
                let json = serde_json::to_string(&report).unwrap_or_default();
                match report.status {
                    HealthStatus::Up => info!(health = %json, "health_report"),
                    HealthStatus::Warning => warn!(health = %json, "health_report"),
                    HealthStatus::Down => error!(health = %json, "health_report"),
                }
            }
        }
    }

    pipeline.stop();
    Ok(())
}
