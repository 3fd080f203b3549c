//! State updates and batches

use crate::error::StateError;
use crate::hashing::{hash_data, HashValue};
use crate::transaction::TransactionId;
use crate::types::RequestId;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A single change to a state variable
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum Mutation {
    Set { key: String, value: Vec<u8> },
    Del { key: String },
}

/// The effect of one request on the state
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct StateUpdate {
    pub request_id: RequestId,
    pub timestamp: i64,
    pub mutations: Vec<Mutation>,
}

impl StateUpdate {
    pub fn new(request_id: RequestId, timestamp: i64) -> Self {
        Self {
            request_id,
            timestamp,
            mutations: Vec::new(),
        }
    }

    pub fn hash(&self) -> HashValue {
        let bytes = borsh::to_vec(self).expect("StateUpdate serialization should not fail");
        hash_data(&[&bytes])
    }
}

/// Ordered sequence of state updates produced by one round, tagged with the
/// state index it produces and the id of its anchoring transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Batch {
    state_index: u32,
    state_tx_id: TransactionId,
    timestamp: i64,
    updates: Vec<StateUpdate>,
}

impl Batch {
    /// Assemble a batch from a complete list of state updates
    pub fn new(updates: Vec<StateUpdate>) -> Result<Self, StateError> {
        if updates.is_empty() {
            return Err(StateError::EmptyBatch);
        }
        if updates.len() > u16::MAX as usize {
            return Err(StateError::ArithmeticOverflow);
        }
        let mut seen = HashSet::with_capacity(updates.len());
        for su in &updates {
            if !seen.insert(su.request_id) {
                return Err(StateError::DuplicateRequest(su.request_id.to_string()));
            }
        }
        let timestamp = updates.iter().map(|su| su.timestamp).max().unwrap_or_default();
        Ok(Self {
            state_index: 0,
            state_tx_id: HashValue::NIL,
            timestamp,
            updates,
        })
    }

    /// The batch producing the origin state. Not yet tagged with the origin
    /// transaction, whose essence commits to the resulting state hash.
    pub fn origin(timestamp: i64) -> Self {
        Self {
            state_index: crate::ORIGIN_STATE_INDEX,
            state_tx_id: HashValue::NIL,
            timestamp,
            updates: vec![StateUpdate::new(RequestId::default(), timestamp)],
        }
    }

    pub fn with_state_index(mut self, state_index: u32) -> Self {
        self.state_index = state_index;
        self
    }

    pub fn with_state_transaction(mut self, tx_id: TransactionId) -> Self {
        self.state_tx_id = tx_id;
        self
    }

    pub fn state_index(&self) -> u32 {
        self.state_index
    }

    pub fn state_tx_id(&self) -> TransactionId {
        self.state_tx_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn size(&self) -> u16 {
        self.updates.len() as u16
    }

    pub fn updates(&self) -> &[StateUpdate] {
        &self.updates
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.updates.iter().map(|su| su.request_id).collect()
    }

    /// Hash of the content, independent of the anchoring transaction
    pub fn essence_hash(&self) -> HashValue {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.state_index.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        for su in &self.updates {
            hasher.update(su.hash().as_bytes());
        }
        HashValue(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch #{} size {} tx {} essence {}",
            self.state_index,
            self.updates.len(),
            self.state_tx_id.short(),
            self.essence_hash().short()
        )
    }
}

/// Identifies a round: ordered request ids, timestamp and leader index
pub fn batch_hash(request_ids: &[RequestId], timestamp: i64, leader_index: u16) -> HashValue {
    let mut hasher = blake3::Hasher::new();
    for id in request_ids {
        hasher.update(&id.to_bytes());
    }
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&leader_index.to_le_bytes());
    HashValue(*hasher.finalize().as_bytes())
}
