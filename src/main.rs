//! bundlemq broker entrypoint.
//!
//! Usage:
//!   bundlemq-broker start --config config/broker.toml
//!
//! With JSON logging:
//!   LOG_FORMAT=json RUST_LOG=info bundlemq-broker start --config config/broker.toml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use bundlemq::cluster::metrics::init_metrics;
use bundlemq::cluster::{open_log_store, Broker, BrokerConfig, MemoryCoordinator};
use bundlemq::server::health::HealthServer;
use bundlemq::server::RpcServer;
use bundlemq::telemetry::{init_logging, LogFormat};

/// How long open connections get to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// bundlemq - partitioned publish/subscribe broker.
#[derive(Parser)]
#[command(name = "bundlemq-broker")]
#[command(version)]
#[command(about = "bundlemq broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a broker
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, env = "BUNDLEMQ_CONFIG", default_value = "config/broker.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    match cli.command {
        Commands::Start(args) => run_start(args).await,
    }
}

async fn run_start(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = BrokerConfig::load(&args.config)?;
    init_metrics();

    if !config.coordination.endpoints.is_empty() {
        warn!(
            endpoints = ?config.coordination.endpoints,
            "External coordination endpoints are not supported, using the in-process store"
        );
    }
    let coordinator = Arc::new(MemoryCoordinator::new());
    let log = open_log_store(&config.persistence)?;

    let addr = config.url();
    let health_addr = format!("{}:{}", config.host, config.health_port);
    let health_enabled = config.health_port > 0;
    let broker = Broker::start(config, coordinator, log).await?;

    let server = Arc::new(RpcServer::new(&addr, Arc::clone(&broker)).await?);
    let health = if health_enabled {
        match HealthServer::new(&health_addr, Arc::clone(&broker)).await {
            Ok(health) => Some(Arc::new(health)),
            Err(e) => {
                warn!(error = %e, "Failed to start health server - continuing without it");
                None
            }
        }
    } else {
        info!("Health server disabled");
        None
    };
    let health_task = health.clone().map(|health| {
        tokio::spawn(async move {
            let _ = health.run().await;
        })
    });

    info!(broker = %broker.name(), address = %addr, "Broker is running");

    let serve = Arc::clone(&server);
    let mut serve_task = tokio::spawn(async move { serve.run().await });
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, shutting down");
        }
        finished = &mut serve_task => {
            finished??;
        }
    }

    if !server.shutdown_and_wait(DRAIN_TIMEOUT).await {
        warn!("Closing with connections still open");
    }
    broker.shutdown().await?;
    if let Some(health) = health {
        health.shutdown();
    }
    if let Some(task) = health_task {
        let _ = task.await;
    }
    Ok(())
}
