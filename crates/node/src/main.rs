//! SC Node
//!
//! Runs a whole smart contract committee in one process: every member is a
//! consensus node on its own task, the members talk over in-process queues and
//! anchor their state to an in-memory ledger. Prints where every member ended up.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cluster;
mod config;

use config::NodeConfig;

/// Smart contract committee node
#[derive(Parser, Debug)]
#[command(name = "sc-node")]
#[command(about = "Run a smart contract committee in-process", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of committee members
    #[arg(long)]
    committee_size: Option<u16>,

    /// Signature shares needed to anchor a state
    #[arg(long)]
    quorum: Option<u16>,

    /// Requests to submit after the origin
    #[arg(long)]
    requests: Option<u32>,

    /// Data directory for sled batch stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Member that never starts (repeatable)
    #[arg(long = "dead-peer")]
    dead_peers: Vec<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(size) = self.committee_size {
            config.committee_size = size;
        }
        if let Some(quorum) = self.quorum {
            config.quorum = quorum;
        }
        if let Some(requests) = self.requests {
            config.requests = requests;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if !self.dead_peers.is_empty() {
            config.dead_peers = self.dead_peers;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    args.apply(&mut config);

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    tracing::info!("Starting smart contract committee");
    tracing::info!("  Members: {} (quorum {})", config.committee_size, config.quorum);
    tracing::info!("  Dead peers: {:?}", config.dead_peers);
    tracing::info!("  Requests: {}", config.requests);
    tracing::info!("  Data directory: {:?}", config.data_dir);

    let report = tokio::select! {
        report = cluster::run_cluster(&config) => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            return Ok(());
        }
    };

    for member in &report.members {
        match (member.state_index, member.state_hash) {
            (Some(index), Some(hash)) => {
                tracing::info!("Peer #{}: state #{} hash {}", member.index, index, hash)
            }
            _ if !member.alive => tracing::info!("Peer #{}: dead", member.index),
            _ => tracing::info!("Peer #{}: no solid state", member.index),
        }
    }

    if !report.converged() {
        bail!(
            "committee did not converge on anchored state {:?}",
            report.anchored_index
        );
    }
    tracing::info!(
        "Committee converged on state #{:?}",
        report.anchored_index
    );
    Ok(())
}
