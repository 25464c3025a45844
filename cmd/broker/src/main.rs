//! Shoepad broker - MQTT 3.1.1 broker for the shoepad sensors.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use shoepad_broker::{Broker, BrokerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Shoepad MQTT broker.
///
/// Listens for MQTT 3.1.1 clients and routes their messages. Stop with Ctrl-C.
#[derive(Parser)]
#[command(name = "shoepad-broker")]
#[command(about = "Minimal MQTT 3.1.1 broker")]
#[command(version)]
struct Cli {
    /// Config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short = 'a', long)]
    addr: Option<String>,

    /// Per-connection flush timeout on disconnect, in milliseconds
    #[arg(long)]
    drain_timeout: Option<u64>,

    /// Time to wait for connections to close on shutdown, in seconds
    #[arg(long, default_value_t = 5)]
    shutdown_timeout: u64,

    /// Append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Cli {
    fn broker_config(&self) -> anyhow::Result<BrokerConfig> {
        let mut config = match self.config {
            Some(ref path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_yaml::from_str(&data)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => BrokerConfig::default(),
        };

        if let Some(ref addr) = self.addr {
            config.addr = addr.clone();
        }
        if let Some(ms) = self.drain_timeout {
            config.drain_timeout_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match cli.log_file {
        Some(ref path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = cli.broker_config()?;
    let broker = Broker::new(config);

    match broker.start().await {
        Ok(addr) => info!("shoepad broker started on {}", addr),
        Err(e) => {
            error!("failed to start broker: {}", e);
            std::process::exit(1);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    broker
        .stop(Duration::from_secs(cli.shutdown_timeout))
        .await;
    Ok(())
}
