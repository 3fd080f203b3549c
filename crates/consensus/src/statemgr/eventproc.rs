//! State manager event handlers

use super::{StateManager, SyncedBatch};
use crate::error::ConsensusError;
use crate::messages::{MessageBody, NodeEvent};
use sc_state::{Batch, StateTransaction, StateUpdate, TransactionId};

impl StateManager {
    /// Answer a peer's batch request from the store
    pub fn event_get_batch(&mut self, sender: u16, state_index: u32) -> Result<(), ConsensusError> {
        tracing::debug!(sender, state_index, "GetBatch");
        let batch = match self.store.load_batch(&self.config.address, state_index) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(state_index, "Failed to load batch: {}", e);
                return Ok(());
            }
        };

        tracing::debug!("Sending {} to peer #{}", batch, sender);
        let header = MessageBody::BatchHeader {
            size: batch.size(),
            state_tx_id: batch.state_tx_id(),
        };
        if let Err(e) = self.committee.send_msg(sender, state_index, header) {
            tracing::debug!(sender, "Batch header not sent: {}", e);
            return Ok(());
        }
        for (i, su) in batch.updates().iter().enumerate() {
            let body = MessageBody::StateUpdate {
                state_tx_id: batch.state_tx_id(),
                batch_index: i as u16,
                state_update: su.clone(),
            };
            if let Err(e) = self.committee.send_msg(sender, state_index, body) {
                tracing::debug!(sender, batch_index = i, "State update not sent: {}", e);
                break;
            }
        }
        Ok(())
    }

    pub fn event_batch_header(
        &mut self,
        sender: u16,
        state_index: u32,
        size: u16,
        state_tx_id: TransactionId,
    ) -> Result<(), ConsensusError> {
        tracing::debug!(sender, state_index, size, state_tx = %state_tx_id, "BatchHeader");
        if self.solid_state_index().is_some_and(|solid| state_index <= solid) {
            return Ok(());
        }
        if size == 0 {
            tracing::warn!(sender, state_index, "Empty batch header ignored");
            return Ok(());
        }
        if let Some(sb) = &self.synced_batch {
            if sb.state_index == state_index
                && sb.state_tx_id == state_tx_id
                && sb.updates.len() == size as usize
            {
                // no need to start from scratch
                return Ok(());
            }
        }
        self.synced_batch = Some(SyncedBatch::new(state_index, size, state_tx_id));
        Ok(())
    }

    /// Collect the updates of the announced batch
    pub fn event_state_update(
        &mut self,
        sender: u16,
        state_index: u32,
        state_tx_id: TransactionId,
        batch_index: u16,
        state_update: StateUpdate,
    ) -> Result<(), ConsensusError> {
        tracing::trace!(sender, state_index, batch_index, "StateUpdate");
        let Some(sb) = self.synced_batch.as_mut() else {
            return Ok(());
        };
        if sb.state_index != state_index || sb.state_tx_id != state_tx_id {
            return Ok(());
        }
        let Some(slot) = sb.updates.get_mut(batch_index as usize) else {
            tracing::warn!(sender, batch_index, "Bad batch index in the state update message");
            return Ok(());
        };
        if slot.is_none() {
            sb.received += 1;
        }
        *slot = Some(state_update);

        if (sb.received as usize) < sb.updates.len() {
            return Ok(());
        }

        // the whole batch received
        let Some(sb) = self.synced_batch.take() else {
            return Ok(());
        };
        let updates: Vec<StateUpdate> = sb.updates.into_iter().flatten().collect();
        let batch = match Batch::new(updates) {
            Ok(batch) => batch
                .with_state_index(sb.state_index)
                .with_state_transaction(sb.state_tx_id),
            Err(e) => {
                tracing::warn!(state_index = sb.state_index, "Failed to assemble batch: {}", e);
                return Ok(());
            }
        };
        tracing::debug!("Reconstructed {}", batch);
        if self.events.send(NodeEvent::PendingBatch(batch)).is_err() {
            tracing::debug!("Event queue closed, reconstructed batch dropped");
        }
        self.take_action()
    }

    /// Anchoring transaction observed on the ledger
    pub fn event_state_transaction(&mut self, tx: StateTransaction) -> Result<(), ConsensusError> {
        let block = tx.state_block();
        let state_index = block.state_index;
        tracing::debug!(
            state_tx = %tx.id(),
            state_index,
            state_hash = %block.state_hash,
            "State transaction"
        );
        self.evidence_state_index(state_index);

        let expected = match (&self.solid_state, self.solid_state_valid) {
            (Some(solid), true) => solid.state_index().checked_add(1),
            (Some(candidate), false) => Some(candidate.state_index()),
            (None, _) => Some(sc_state::ORIGIN_STATE_INDEX),
        };
        if expected != Some(state_index) {
            tracing::debug!(state_index, ?expected, "State transaction out of sequence");
            return Ok(());
        }
        self.next_state_transaction = Some(tx);
        self.take_action()
    }

    pub fn event_pending_batch(&mut self, batch: Batch) -> Result<(), ConsensusError> {
        tracing::debug!(
            state_index = batch.state_index(),
            size = batch.size(),
            state_tx = %batch.state_tx_id(),
            essence = %batch.essence_hash(),
            ts = batch.timestamp(),
            "Pending batch"
        );
        self.add_pending_batch(batch);
        self.take_action()
    }

    pub fn event_timer_tick(&mut self, tick: u64) -> Result<(), ConsensusError> {
        if tick % self.config.sync_tick_divisor.max(1) == 0 {
            self.take_action()?;
        }
        Ok(())
    }
}
