//! SolCharge Node
//!
//! Device-integration daemon: OCPP server for charging stations plus the
//! Modbus polling fleet for solar inverters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use solcharge_core::MemoryStore;
use solcharge_modbus::PollerConfig;
use solcharge_ocpp::{EngineConfig, OcppServerConfig};

use solcharge_node::{FleetConfig, FleetSupervisor};

/// SolCharge device-integration daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fleet configuration file (stations, inverters, accounts)
    #[arg(short, long, default_value = "fleet.json")]
    config: PathBuf,

    /// OCPP listen address (overrides the config file)
    #[arg(long)]
    ocpp_bind: Option<String>,

    /// Inverter poll interval in seconds
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("solcharge node starting");

    let fleet = FleetConfig::load(&args.config)?;
    let store = Arc::new(MemoryStore::new());
    fleet.seed(store.as_ref());

    let ocpp_config = OcppServerConfig {
        bind_addr: args.ocpp_bind.unwrap_or_else(|| fleet.ocpp_bind.clone()),
        engine: EngineConfig::default(),
    };
    let poller_config = PollerConfig {
        poll_interval: Duration::from_secs(args.poll_interval),
        ..Default::default()
    };

    let mut supervisor = FleetSupervisor::new(store, ocpp_config, poller_config);
    supervisor.start().await;

    info!("running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    supervisor.shutdown().await;
    Ok(())
}
