//! Binary entrypoint for the MDB bus master.
//!
//! Opens the USB board, optionally starts the sniffer, claims the bus, enables
//! the peripherals, prints their status as JSON and keeps them running until
//! ctrl-c.
use anyhow::{Context, Result};
use clap::Parser;
use mdb_master::adapters::SerialChannel;
use mdb_master::config::{MasterConfig, DEFAULT_CONFIG_PATH};
use mdb_master::{BusMaster, Peripheral, Sniffer, StatusInfo};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mdb_master")]
#[command(about = "Bus master for MDB vending peripherals behind a USB serial board")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial device of the MDB board (overrides the configuration)
    #[arg(short, long)]
    device_path: Option<String>,

    /// Skip the bus reset after claiming mastership
    #[arg(long)]
    no_bus_reset: bool,

    /// Log all bus traffic mirrored by the board
    #[arg(long)]
    sniff: bool,
}

impl Cli {
    fn apply(&self, config: &mut MasterConfig) {
        if let Some(device_path) = &self.device_path {
            config.device_path = device_path.clone();
        }
        if self.no_bus_reset {
            config.bus_reset = false;
        }
        if self.sniff {
            config.sniff = true;
        }
    }
}

/// Device drivers compiled into this binary; integrators register theirs here.
fn peripherals() -> Vec<Box<dyn Peripheral>> {
    Vec::new()
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MasterConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply(&mut config);
    config.validate()?;

    init_logging(&config.log_level);
    info!("Starting mdb_master v{}", env!("CARGO_PKG_VERSION"));

    let channel = SerialChannel::open(
        &config.device_path,
        config.baud_rate,
        config.response_timeout(),
    )?;

    let mut sniffer = Sniffer::new();
    if config.sniff {
        sniffer.initialize(&channel).await?;
    }

    let mut master = BusMaster::new(&config.device_path);
    master
        .initialize(Box::new(channel.clone()), peripherals(), config.bus_reset)
        .await?;

    let names: Vec<String> = master
        .peripheral_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    for (name, outcome) in names.iter().zip(master.enable().await?) {
        if let Err(e) = outcome {
            warn!("Failed to enable {}: {:#}", name, e);
        }
    }

    let mut statuses: Vec<StatusInfo> = Vec::new();
    for (name, outcome) in names.iter().zip(master.status().await?) {
        match outcome {
            Ok(status) => statuses.push(status),
            Err(e) => warn!("Failed to get status of {}: {:#}", name, e),
        }
    }
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    let running = async {
        master.run().await?;
        info!("No peripheral loops running, waiting for shutdown signal");
        futures::future::pending::<mdb_master::AppResult<()>>().await
    };

    let outcome = tokio::select! {
        result = running => result.context("peripheral loop failed"),
        result = sniffer.run(), if config.sniff => {
            warn!("Sniffer stopped");
            result.context("sniffer failed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    for (name, outcome) in names.iter().zip(master.disable().await?) {
        if let Err(e) = outcome {
            warn!("Failed to disable {}: {:#}", name, e);
        }
    }
    if let Err(e) = sniffer.shutdown().await {
        error!("Sniffer shutdown failed: {}", e);
    }
    channel.shutdown();

    outcome
}
