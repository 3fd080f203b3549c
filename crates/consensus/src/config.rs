//! Consensus configuration

use sc_state::{Address, HashValue};
use std::time::Duration;

/// Default leader rotation period
pub const LEADER_ROTATION_PERIOD: Duration = Duration::from_secs(3);

/// Default period between batch requests to peers
pub const SYNC_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Default timer tick period of the node event loop
pub const TIMER_TICK_PERIOD: Duration = Duration::from_millis(100);

/// Configuration of one committee member for one contract
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Contract address
    pub address: Address,
    /// Contract owner, authorises protected requests
    pub owner_address: Address,
    /// Program run by the contract
    pub program_hash: HashValue,
    /// Where request rewards go; `None` disables rewards
    pub reward_address: Option<Address>,
    pub minimum_reward: u64,
    /// How long a leader has to finalize a round before it is skipped
    pub leader_rotation_period: Duration,
    /// How long to wait for a peer to answer a batch request
    pub sync_retry_period: Duration,
    /// Maximum number of requests in one batch
    pub max_batch_size: usize,
    pub timer_tick_period: Duration,
    /// The state manager acts on every n-th timer tick
    pub sync_tick_divisor: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            address: Address::default(),
            owner_address: Address::default(),
            program_hash: HashValue::NIL,
            reward_address: None,
            minimum_reward: 0,
            leader_rotation_period: LEADER_ROTATION_PERIOD,
            sync_retry_period: SYNC_RETRY_PERIOD,
            max_batch_size: 100,
            timer_tick_period: TIMER_TICK_PERIOD,
            sync_tick_divisor: 2,
        }
    }
}
