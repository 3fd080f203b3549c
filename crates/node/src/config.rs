//! Node Configuration

use anyhow::{bail, Context, Result};
use sc_consensus::ConsensusConfig;
use sc_state::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local committee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of committee members
    pub committee_size: u16,
    /// Signature shares needed to anchor a state
    pub quorum: u16,
    /// Requests submitted after the origin
    pub requests: u32,
    /// Members which never start
    pub dead_peers: Vec<u16>,
    /// Sled stores go to `<data_dir>/peer-<i>`; in-memory stores when unset
    pub data_dir: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Seeds the contract address
    pub contract_seed: String,
    /// Seeds the committee key shares
    pub committee_seed: String,
    /// Tokens held by the contract at origin
    pub origin_balance: u64,
    pub max_batch_size: usize,
    /// Concurrent execution tasks across the committee
    pub max_tasks: usize,
    pub leader_rotation_ms: u64,
    pub sync_retry_ms: u64,
    pub timer_tick_ms: u64,
    /// Give up waiting for convergence after this long
    pub timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            committee_size: 4,
            quorum: 3,
            requests: 10,
            dead_peers: Vec::new(),
            data_dir: None,
            log_level: "info".to_string(),
            contract_seed: "sc-node contract".to_string(),
            committee_seed: "sc-node committee".to_string(),
            origin_balance: 1_000,
            max_batch_size: 100,
            max_tasks: 8,
            leader_rotation_ms: 3_000,
            sync_retry_ms: 1_000,
            timer_tick_ms: 100,
            timeout_secs: 60,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.committee_size == 0 {
            bail!("committee must have at least one member");
        }
        if self.quorum == 0 || self.quorum > self.committee_size {
            bail!(
                "quorum {} is invalid for a committee of {}",
                self.quorum,
                self.committee_size
            );
        }
        if let Some(peer) = self.dead_peers.iter().find(|&&p| p >= self.committee_size) {
            bail!("dead peer #{} is not a committee member", peer);
        }
        if self.alive_count() < self.quorum as usize {
            bail!(
                "only {} of {} members alive, quorum {} can't be reached",
                self.alive_count(),
                self.committee_size,
                self.quorum
            );
        }
        if self.max_batch_size == 0 || self.max_tasks == 0 {
            bail!("max_batch_size and max_tasks must be positive");
        }
        if self.timer_tick_ms == 0 {
            bail!("timer_tick_ms must be positive");
        }
        Ok(())
    }

    pub fn is_dead(&self, peer: u16) -> bool {
        self.dead_peers.contains(&peer)
    }

    pub fn alive_count(&self) -> usize {
        (0..self.committee_size).filter(|&p| !self.is_dead(p)).count()
    }

    pub fn contract_address(&self) -> Address {
        Address::from_seed(&self.contract_seed)
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        let address = self.contract_address();
        ConsensusConfig {
            address,
            owner_address: Address::from_seed(&format!("{} owner", self.contract_seed)),
            max_batch_size: self.max_batch_size,
            leader_rotation_period: Duration::from_millis(self.leader_rotation_ms),
            sync_retry_period: Duration::from_millis(self.sync_retry_ms),
            timer_tick_period: Duration::from_millis(self.timer_tick_ms),
            ..Default::default()
        }
    }
}
