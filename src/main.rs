// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! replica-node - one replica of the logistics service
//!
//! Usage:
//!   replica-node serve      - HTTP API, publisher and consumer worker
//!   replica-node consume    - consumer worker only

use clap::{Parser, Subcommand};
use logistics_replication::{NodeConfig, ReplicaNode, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replica-node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Replica of the logistics service with broker-based mesh replication")]
struct Cli {
    /// Configuration file (YAML or JSON). Environment variables override it.
    #[arg(short, long, env = "REPLICA_CONFIG")]
    config: Option<PathBuf>,

    /// Node id, overriding config and environment
    #[arg(long)]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and consume the inbound queue
    Serve,
    /// Consume the inbound queue only
    Consume,
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => {
            // Port is derived from the node id unless set
            let mut config = NodeConfig::default();
            config.node.port = 0;
            config
        }
    };
    // --node-id beats NODE_ID/SERVER_ID, which beat the file
    match &cli.node_id {
        Some(id) => config.apply_overrides(|key| match key {
            "NODE_ID" => Some(id.clone()),
            _ => std::env::var(key).ok(),
        })?,
        None => config.apply_env_overrides()?,
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received");
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let node = ReplicaNode::new(config)?;
    match cli.command {
        Commands::Serve => node.serve(shutdown_signal()).await,
        Commands::Consume => node.consume(shutdown_signal()).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "replica-node failed");
            ExitCode::FAILURE
        }
    }
}
