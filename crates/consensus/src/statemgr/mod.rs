//! State manager - keeps the local solid state in line with the ledger
//!
//! Applies pending batches one state index at a time, once the anchoring
//! transaction for that index is evidenced, and fetches missing batches from
//! peers.

mod action;
mod eventproc;

use crate::committee::Committee;
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::ledger::LedgerClient;
use crate::messages::EventSender;
use crate::permutation::PeerPermutation;
use sc_state::{Batch, BatchStore, StateTransaction, StateUpdate, TransactionId, VirtualState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A batch being reassembled from peer messages
#[derive(Debug)]
pub(crate) struct SyncedBatch {
    pub state_index: u32,
    pub state_tx_id: TransactionId,
    pub updates: Vec<Option<StateUpdate>>,
    pub received: u16,
}

impl SyncedBatch {
    fn new(state_index: u32, size: u16, state_tx_id: TransactionId) -> Self {
        Self {
            state_index,
            state_tx_id,
            updates: vec![None; size as usize],
            received: 0,
        }
    }
}

pub struct StateManager {
    committee: Arc<dyn Committee>,
    store: Arc<dyn BatchStore>,
    ledger: Arc<dyn LedgerClient>,
    events: EventSender,
    config: ConsensusConfig,

    solid_state: Option<Arc<VirtualState>>,
    /// False while `solid_state` is a persisted candidate not yet matched with its anchor
    solid_state_valid: bool,
    /// Evidenced anchoring transaction expected to be applied next
    next_state_transaction: Option<StateTransaction>,
    largest_evidenced_state_index: Option<u32>,
    /// Reconstructed batches keyed by state index and anchoring transaction id
    pending_batches: HashMap<(u32, TransactionId), Batch>,
    synced_batch: Option<SyncedBatch>,
    /// Order in which peers are asked for missing batches
    sync_peers: PeerPermutation,
    sync_retry_deadline: Option<Instant>,
}

impl StateManager {
    pub fn new(
        committee: Arc<dyn Committee>,
        store: Arc<dyn BatchStore>,
        ledger: Arc<dyn LedgerClient>,
        events: EventSender,
        config: ConsensusConfig,
    ) -> Result<Self, ConsensusError> {
        let solid_state = store.load_solid_state(&config.address)?.map(Arc::new);
        match &solid_state {
            Some(state) => tracing::info!(
                address = %config.address,
                state_index = state.state_index(),
                state_hash = %state.hash(),
                "Loaded persisted state, waiting for its anchoring transaction"
            ),
            None => tracing::info!(address = %config.address, "No persisted state, waiting for origin"),
        }

        let own = committee.own_index();
        let mut sync_peers = PeerPermutation::new(committee.size());
        sync_peers.shuffle(&own.to_le_bytes());

        Ok(Self {
            committee,
            store,
            ledger,
            events,
            config,
            solid_state,
            solid_state_valid: false,
            next_state_transaction: None,
            largest_evidenced_state_index: None,
            pending_batches: HashMap::new(),
            synced_batch: None,
            sync_peers,
            sync_retry_deadline: None,
        })
    }

    /// Latest solid state, if validated against the ledger
    pub fn solid_state(&self) -> Option<Arc<VirtualState>> {
        if self.solid_state_valid {
            self.solid_state.clone()
        } else {
            None
        }
    }

    pub fn solid_state_index(&self) -> Option<u32> {
        self.solid_state().map(|s| s.state_index())
    }

    pub fn largest_evidenced_state_index(&self) -> Option<u32> {
        self.largest_evidenced_state_index
    }

    /// Record the highest state index seen on the ledger
    fn evidence_state_index(&mut self, state_index: u32) {
        if self.largest_evidenced_state_index.map_or(true, |i| i < state_index) {
            self.largest_evidenced_state_index = Some(state_index);
        }
    }

    fn add_pending_batch(&mut self, batch: Batch) {
        if let Some(solid) = self.solid_state() {
            if batch.state_index() <= solid.state_index() {
                tracing::debug!(batch = %batch, "Pending batch for an applied state index dropped");
                return;
            }
        }
        self.pending_batches
            .insert((batch.state_index(), batch.state_tx_id()), batch);
    }
}
