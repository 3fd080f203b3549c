//! Batch stores
//!
//! Batches are immutable once stored. The solid state of each contract
//! address is stored alongside, so a restarted node can resume from it.
//! `PersistentStore` uses the sled embedded database; `MemoryBatchStore` is a
//! DashMap-backed store for simulations and tests.

use crate::batch::Batch;
use crate::error::StoreError;
use crate::state::VirtualState;
use crate::types::Address;
use dashmap::DashMap;
use std::path::Path;

/// Storage of applied batches and the latest solid state
pub trait BatchStore: Send + Sync {
    fn load_batch(&self, address: &Address, state_index: u32) -> Result<Option<Batch>, StoreError>;

    fn save_batch(&self, address: &Address, batch: &Batch) -> Result<(), StoreError>;

    fn load_solid_state(&self, address: &Address) -> Result<Option<VirtualState>, StoreError>;

    fn save_solid_state(&self, state: &VirtualState) -> Result<(), StoreError>;
}

/// In-memory batch store
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: DashMap<(Address, u32), Batch>,
    solid_states: DashMap<Address, VirtualState>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

impl BatchStore for MemoryBatchStore {
    fn load_batch(&self, address: &Address, state_index: u32) -> Result<Option<Batch>, StoreError> {
        Ok(self
            .batches
            .get(&(*address, state_index))
            .map(|r| r.value().clone()))
    }

    fn save_batch(&self, address: &Address, batch: &Batch) -> Result<(), StoreError> {
        let key = (*address, batch.state_index());
        if let Some(existing) = self.batches.get(&key) {
            if existing.value() != batch {
                return Err(StoreError::Immutable(batch.state_index()));
            }
            return Ok(());
        }
        self.batches.insert(key, batch.clone());
        Ok(())
    }

    fn load_solid_state(&self, address: &Address) -> Result<Option<VirtualState>, StoreError> {
        Ok(self.solid_states.get(address).map(|r| r.value().clone()))
    }

    fn save_solid_state(&self, state: &VirtualState) -> Result<(), StoreError> {
        self.solid_states.insert(*state.address(), state.clone());
        Ok(())
    }
}

/// Persistent batch store backed by sled
pub struct PersistentStore {
    db: sled::Db,
    /// address ++ big-endian state index -> batch
    batches: sled::Tree,
    /// address -> solid state
    solid_states: sled::Tree,
}

impl PersistentStore {
    /// Open or create a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        let batches = db.open_tree("batches")?;
        let solid_states = db.open_tree("solid_states")?;

        tracing::info!("Opened batch store at {:?}", path.as_ref());

        Ok(Self {
            db,
            batches,
            solid_states,
        })
    }

    fn batch_key(address: &Address, state_index: u32) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&address.0);
        key[32..].copy_from_slice(&state_index.to_be_bytes());
        key
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of stored batches across all addresses
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

impl BatchStore for PersistentStore {
    fn load_batch(&self, address: &Address, state_index: u32) -> Result<Option<Batch>, StoreError> {
        match self.batches.get(Self::batch_key(address, state_index))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_batch(&self, address: &Address, batch: &Batch) -> Result<(), StoreError> {
        let key = Self::batch_key(address, batch.state_index());
        let bytes = bincode::serialize(batch)?;
        match self.batches.compare_and_swap(key, None as Option<&[u8]>, Some(bytes.as_slice()))? {
            Ok(()) => Ok(()),
            Err(cas) if cas.current.as_deref() == Some(bytes.as_slice()) => Ok(()),
            Err(_) => Err(StoreError::Immutable(batch.state_index())),
        }
    }

    fn load_solid_state(&self, address: &Address) -> Result<Option<VirtualState>, StoreError> {
        match self.solid_states.get(address.0)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_solid_state(&self, state: &VirtualState) -> Result<(), StoreError> {
        let bytes = bincode::serialize(state)?;
        self.solid_states.insert(state.address().0, bytes)?;
        self.db.flush()?;
        Ok(())
    }
}
