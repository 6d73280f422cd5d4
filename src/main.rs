//! Binary entrypoint for the trackside gateway.
//!
//! Commands:
//! - `run [--config <path>]` - serve the gateway, emitting decoded batches
//!   as NDJSON on stdout
//! - `check [--config <path>]` - load config and compile the protocol
//!   definition, then exit; lets operators validate a new protocol file
//!   without binding sockets

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use trackside::sink::EmissionSink;
use trackside::{
    ChunkPlan, DecodeRegistry, Gateway, GatewayConfig, NdjsonSink, UdpIngest, batch_channel,
    compile_str,
};

#[derive(Parser)]
#[command(name = "trackside")]
#[command(about = "Configuration-driven binary telemetry gateway for rail field devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Gateway configuration file
        #[arg(short, long, default_value = "gateway.yaml")]
        config: PathBuf,
    },
    /// Validate the configuration and protocol definition, then exit
    Check {
        /// Gateway configuration file
        #[arg(short, long, default_value = "gateway.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Check { config } => check(&config),
    }
}

fn load(config_path: &Path) -> Result<(GatewayConfig, ChunkPlan)> {
    let config = GatewayConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let registry = DecodeRegistry::with_builtins();
    let text = std::fs::read_to_string(&config.protocol)
        .with_context(|| format!("reading protocol file {}", config.protocol.display()))?;
    let plan = compile_str(&text, &registry)
        .with_context(|| format!("compiling {}", config.protocol.display()))?;
    Ok((config, plan))
}

fn check(config_path: &Path) -> Result<()> {
    let (config, plan) = load(config_path)?;
    info!(
        protocol = %config.protocol.display(),
        chunks = plan.chunk_count(),
        exports = plan.schema().len(),
        "protocol definition ok"
    );
    Ok(())
}

async fn run(config_path: &Path) -> Result<()> {
    let (config, plan) = load(config_path)?;
    let (batch_tx, mut batch_rx) = batch_channel(config.queue_capacity);

    let udp_listen = config.udp_listen.clone();
    let gateway = Gateway::new(config, plan);
    let cancel = gateway.cancellation_token();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        }
    });

    let udp_task = udp_listen.map(|addr| {
        let ingest =
            UdpIngest::new(gateway.plan(), gateway.identity(), batch_tx.clone(), cancel.clone());
        tokio::spawn(async move {
            match tokio::net::UdpSocket::bind(&addr).await {
                Ok(socket) => {
                    if let Err(err) = ingest.run(socket).await {
                        error!(error = %err, "udp ingest failed");
                    }
                }
                Err(err) => error!(addr = %addr, error = %err, "udp bind failed"),
            }
        })
    });

    let consumer = tokio::spawn(async move {
        let mut sink = NdjsonSink::new(std::io::stdout());
        while let Some(batch) = batch_rx.recv().await {
            if let Err(err) = sink.emit(batch).await {
                error!(error = %err, "emission failed, dropping consumer");
                break;
            }
        }
    });

    let served = gateway.run(batch_tx).await;

    if let Some(task) = udp_task {
        let _ = task.await;
    }
    let _ = consumer.await;
    served.context("gateway terminated with error")
}
