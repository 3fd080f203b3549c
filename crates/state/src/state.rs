//! Virtual state: the key/value state of the contract at some state index

use crate::batch::{Batch, Mutation};
use crate::error::StateError;
use crate::hashing::{hash_data, HashValue};
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contract state after applying a linear history of batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualState {
    address: Address,
    state_index: u32,
    timestamp: i64,
    state_hash: HashValue,
    variables: BTreeMap<String, Vec<u8>>,
}

impl VirtualState {
    /// Build state #0 out of the origin batch
    pub fn origin(address: Address, batch: &Batch) -> Result<Self, StateError> {
        if batch.state_index() != crate::ORIGIN_STATE_INDEX {
            return Err(StateError::WrongStateIndex {
                current: crate::ORIGIN_STATE_INDEX,
                got: batch.state_index(),
            });
        }
        let mut state = Self {
            address,
            state_index: crate::ORIGIN_STATE_INDEX,
            timestamp: batch.timestamp(),
            state_hash: hash_data(&[b"origin", &address.0]),
            variables: BTreeMap::new(),
        };
        state.apply_updates(batch);
        Ok(state)
    }

    /// Apply the batch for the next state index, returning the new state
    pub fn apply_batch(&self, batch: &Batch) -> Result<Self, StateError> {
        let expected = self
            .state_index
            .checked_add(1)
            .ok_or(StateError::ArithmeticOverflow)?;
        if batch.state_index() != expected {
            return Err(StateError::WrongStateIndex {
                current: self.state_index,
                got: batch.state_index(),
            });
        }
        let mut next = self.clone();
        next.state_index = expected;
        next.timestamp = batch.timestamp();
        next.apply_updates(batch);
        Ok(next)
    }

    fn apply_updates(&mut self, batch: &Batch) {
        for su in batch.updates() {
            for m in &su.mutations {
                match m {
                    Mutation::Set { key, value } => {
                        self.variables.insert(key.clone(), value.clone());
                    }
                    Mutation::Del { key } => {
                        self.variables.remove(key);
                    }
                }
            }
        }
        self.state_hash = hash_data(&[self.state_hash.as_bytes(), batch.essence_hash().as_bytes()]);
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state_index(&self) -> u32 {
        self.state_index
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn hash(&self) -> HashValue {
        self.state_hash
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.variables.get(key).map(Vec::as_slice)
    }

    pub fn variables(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.variables
    }
}
