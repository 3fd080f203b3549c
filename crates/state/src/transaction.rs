//! Anchoring (state) transactions

use crate::batch::Batch;
use crate::hashing::{hash_data, HashValue};
use crate::state::VirtualState;
use crate::types::{Address, RequestId};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Ledger transaction id
pub type TransactionId = HashValue;

/// Token transfer out of the contract address
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Output {
    pub address: Address,
    pub amount: u64,
}

/// State section of an anchoring transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct StateBlock {
    pub state_index: u32,
    /// Hash of the virtual state after the batch has been applied
    pub state_hash: HashValue,
    pub timestamp: i64,
    /// Requests settled by this transaction
    pub request_ids: Vec<RequestId>,
}

/// Signable part of an anchoring transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct TxEssence {
    /// Contract address
    pub address: Address,
    /// Tokens remaining in the contract address
    pub balance: u64,
    /// Rewards paid out by this transaction
    pub rewards: Vec<Output>,
    pub state: StateBlock,
}

/// Transaction committing a batch's resulting state to the ledger
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct StateTransaction {
    pub essence: TxEssence,
    pub signature: Option<Vec<u8>>,
}

impl StateTransaction {
    pub fn new(essence: TxEssence) -> Self {
        Self {
            essence,
            signature: None,
        }
    }

    /// The transaction creating state #0 of a contract
    pub fn origin(address: Address, balance: u64, timestamp: i64) -> Self {
        let origin_batch = Batch::origin(timestamp);
        let state_hash = VirtualState::origin(address, &origin_batch)
            .map(|s| s.hash())
            .unwrap_or_default();
        Self::new(TxEssence {
            address,
            balance,
            rewards: Vec::new(),
            state: StateBlock {
                state_index: crate::ORIGIN_STATE_INDEX,
                state_hash,
                timestamp,
                request_ids: Vec::new(),
            },
        })
    }

    /// Transaction id, covering essence and signature
    pub fn id(&self) -> TransactionId {
        let sig = self.signature.as_deref().unwrap_or_default();
        hash_data(&[&self.essence_bytes(), sig])
    }

    pub fn essence_bytes(&self) -> Vec<u8> {
        borsh::to_vec(&self.essence).expect("TxEssence serialization should not fail")
    }

    pub fn essence_hash(&self) -> HashValue {
        hash_data(&[&self.essence_bytes()])
    }

    pub fn state_block(&self) -> &StateBlock {
        &self.essence.state
    }

    pub fn state_index(&self) -> u32 {
        self.essence.state.state_index
    }

    pub fn put_signature(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("StateTransaction serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}
