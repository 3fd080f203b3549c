//! Consensus errors

use sc_state::StoreError;
use thiserror::Error;

/// Errors surfaced by event handlers.
///
/// Transient protocol faults are logged where they happen and never reach
/// this type. `Invariant` marks a local programming or environment defect and
/// stops the node.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Local invariant violated: {0}")]
    Invariant(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ConsensusError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        ConsensusError::Invariant(msg.into())
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, ConsensusError::Invariant(_))
    }
}

/// Errors sending to committee peers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitteeError {
    #[error("Unknown peer #{0}")]
    UnknownPeer(u16),

    #[error("Peer #{0} is not alive")]
    PeerDead(u16),

    #[error("Connection to peer #{0} is closed")]
    Disconnected(u16),
}

/// Threshold signing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("No signing key share")]
    NoSigningKey,

    #[error("Invalid threshold {threshold} for committee of {size}")]
    BadThreshold { threshold: u16, size: u16 },

    #[error("Not enough valid shares: have {have}, need {need}")]
    NotEnoughShares { have: usize, need: usize },

    #[error("Malformed signature: {0}")]
    Malformed(String),
}
