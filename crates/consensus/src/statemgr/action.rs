//! Deciding the next synchronization step

use super::StateManager;
use crate::error::ConsensusError;
use crate::messages::{MessageBody, NodeEvent};
use sc_state::{Batch, StateTransaction, VirtualState};
use std::sync::Arc;
use std::time::Instant;

impl StateManager {
    /// Take at most one step towards the ledger's state
    pub fn take_action(&mut self) -> Result<(), ConsensusError> {
        if self.check_state_approval() {
            return Ok(());
        }
        self.request_missing_data();
        Ok(())
    }

    /// Apply the next state if both its batch and its anchor are present.
    /// Returns whether the solid state changed.
    fn check_state_approval(&mut self) -> bool {
        let Some(tx) = self.next_state_transaction.clone() else {
            return false;
        };
        let tx_id = tx.id();
        let declared_hash = tx.state_block().state_hash;

        match (self.solid_state.clone(), self.solid_state_valid) {
            (Some(solid), true) => {
                let key = (solid.state_index() + 1, tx_id);
                let Some(batch) = self.pending_batches.get(&key).cloned() else {
                    return false;
                };
                let next = match solid.apply_batch(&batch) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::warn!(batch = %batch, "Pending batch cannot be applied: {}", e);
                        self.pending_batches.remove(&key);
                        return false;
                    }
                };
                if next.hash() != declared_hash {
                    tracing::warn!(
                        state_index = next.state_index(),
                        computed = %next.hash(),
                        expected = %declared_hash,
                        "State hash mismatch, pending batch dropped"
                    );
                    self.pending_batches.remove(&key);
                    return false;
                }
                self.commit(batch, next, tx)
            }
            (Some(candidate), false) => {
                if candidate.hash() != declared_hash {
                    tracing::error!(
                        state_index = candidate.state_index(),
                        persisted = %candidate.hash(),
                        anchored = %declared_hash,
                        "Persisted state does not match its anchoring transaction"
                    );
                    self.next_state_transaction = None;
                    return false;
                }
                tracing::info!(
                    state_index = candidate.state_index(),
                    state_hash = %candidate.hash(),
                    "Persisted state validated"
                );
                self.solid_state_valid = true;
                self.announce_transition(candidate, tx);
                true
            }
            (None, _) => {
                let origin_batch = Batch::origin(tx.state_block().timestamp);
                let origin = match VirtualState::origin(self.config.address, &origin_batch) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!("Cannot build origin state: {}", e);
                        return false;
                    }
                };
                if origin.hash() != declared_hash {
                    tracing::warn!(
                        computed = %origin.hash(),
                        expected = %declared_hash,
                        "Origin state hash mismatch"
                    );
                    self.next_state_transaction = None;
                    return false;
                }
                self.commit(origin_batch.with_state_transaction(tx_id), origin, tx)
            }
        }
    }

    /// Persist and adopt the new solid state.
    /// A state whose batch can't be stored is not adopted, peers could not be served it.
    fn commit(&mut self, batch: Batch, state: VirtualState, tx: StateTransaction) -> bool {
        let address = self.config.address;
        if let Err(e) = self.store.save_batch(&address, &batch) {
            tracing::error!(batch = %batch, "Failed to save batch, state not applied: {}", e);
            self.pending_batches
                .remove(&(batch.state_index(), batch.state_tx_id()));
            return false;
        }
        if let Err(e) = self.store.save_solid_state(&state) {
            tracing::error!(state_index = state.state_index(), "Failed to save solid state: {}", e);
        }

        let state_index = state.state_index();
        self.pending_batches.retain(|(index, _), _| *index > state_index);
        if self
            .synced_batch
            .as_ref()
            .is_some_and(|sb| sb.state_index <= state_index)
        {
            self.synced_batch = None;
        }
        tracing::info!(
            state_index,
            state_hash = %state.hash(),
            state_tx = %tx.id(),
            "Solid state advanced"
        );
        self.solid_state_valid = true;
        self.announce_transition(Arc::new(state), tx);
        true
    }

    fn announce_transition(&mut self, state: Arc<VirtualState>, tx: StateTransaction) {
        self.solid_state = Some(state.clone());
        self.next_state_transaction = None;
        self.sync_retry_deadline = None;
        if self
            .events
            .send(NodeEvent::StateTransition { state, state_tx: tx })
            .is_err()
        {
            tracing::debug!("Event queue closed, state transition not announced");
        }
    }

    /// Ask the ledger or a peer for whatever blocks the next state
    fn request_missing_data(&mut self) {
        if self
            .sync_retry_deadline
            .is_some_and(|deadline| Instant::now() < deadline)
        {
            return;
        }
        let Some(solid) = self.solid_state() else {
            self.request_candidate_anchor();
            return;
        };
        let next = solid.state_index() + 1;

        if self.next_state_transaction.is_none() {
            let pending_tx = self
                .pending_batches
                .keys()
                .find(|(index, _)| *index == next)
                .map(|(_, tx_id)| *tx_id);
            if let Some(tx_id) = pending_tx {
                tracing::debug!(state_index = next, state_tx = %tx_id, "Requesting anchoring transaction");
                self.ledger.request_transaction(tx_id);
                self.arm_sync_retry();
                return;
            }
            if self.largest_evidenced_state_index.map_or(true, |i| i < next) {
                // not behind
                return;
            }
        }

        let own = self.committee.own_index();
        for _ in 0..self.sync_peers.len() {
            let peer = self.sync_peers.next();
            if peer == own || !self.committee.is_alive(peer) {
                continue;
            }
            match self.committee.send_msg(peer, next, MessageBody::GetBatch) {
                Ok(()) => {
                    tracing::debug!(peer, state_index = next, "Requested batch");
                    self.arm_sync_retry();
                    return;
                }
                Err(e) => tracing::debug!(peer, "GetBatch not sent: {}", e),
            }
        }
        tracing::debug!(state_index = next, "No peer to request the batch from");
    }

    /// The ledger moved past the persisted candidate, so its own anchor is
    /// never replayed unasked. The stored batch names it.
    fn request_candidate_anchor(&mut self) {
        let Some(candidate) = self.solid_state.clone() else {
            return;
        };
        let index = candidate.state_index();
        if self.largest_evidenced_state_index.map_or(true, |i| i <= index) {
            return;
        }
        match self.store.load_batch(&self.config.address, index) {
            Ok(Some(batch)) => {
                tracing::debug!(
                    state_index = index,
                    state_tx = %batch.state_tx_id(),
                    "Requesting anchoring transaction of the persisted state"
                );
                self.ledger.request_transaction(batch.state_tx_id());
                self.arm_sync_retry();
            }
            Ok(None) => tracing::warn!(state_index = index, "No stored batch for the persisted state"),
            Err(e) => tracing::warn!(state_index = index, "Failed to load batch: {}", e),
        }
    }

    fn arm_sync_retry(&mut self) {
        self.sync_retry_deadline = Some(Instant::now() + self.config.sync_retry_period);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Harness;
    use crate::config::ConsensusConfig;
    use crate::messages::{EventReceiver, MessageBody, NodeEvent, PeerMessage};
    use crate::statemgr::StateManager;
    use sc_state::{
        hash_data, Address, Batch, BatchStore, Mutation, RequestId, StateBlock, StateTransaction,
        StateUpdate, TxEssence, VirtualState,
    };
    use std::time::Duration;

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            address: Address::from_seed("contract"),
            sync_retry_period: Duration::ZERO,
            ..Default::default()
        }
    }

    fn batch_for(index: u32, n: u8) -> Batch {
        let mut su = StateUpdate::new(RequestId::new(hash_data(&[&[n]]), 0), 100 * index as i64);
        su.mutations.push(Mutation::Set {
            key: "v".into(),
            value: vec![n],
        });
        Batch::new(vec![su]).unwrap().with_state_index(index)
    }

    /// Chain of anchoring transactions and tagged batches for states 1..=len
    fn chain(origin: &VirtualState, len: u32) -> Vec<(StateTransaction, Batch)> {
        let mut state = origin.clone();
        let mut out = Vec::new();
        for i in 1..=len {
            let batch = batch_for(i, i as u8);
            state = state.apply_batch(&batch).unwrap();
            let mut tx = StateTransaction::new(TxEssence {
                address: *origin.address(),
                balance: 0,
                rewards: Vec::new(),
                state: StateBlock {
                    state_index: i,
                    state_hash: state.hash(),
                    timestamp: batch.timestamp(),
                    request_ids: batch.request_ids(),
                },
            });
            tx.put_signature(vec![i as u8]);
            let batch = batch.with_state_transaction(tx.id());
            out.push((tx, batch));
        }
        out
    }

    fn drain(rx: &mut EventReceiver) -> Vec<NodeEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn transitions(events: &[NodeEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|ev| match ev {
                NodeEvent::StateTransition { state, .. } => Some(state.state_index()),
                _ => None,
            })
            .collect()
    }

    /// State manager which has applied the origin
    fn at_origin(h: &mut Harness) -> (StateManager, VirtualState) {
        let config = config();
        let mut sm = h.state_manager(0, config.clone());
        let origin_tx = StateTransaction::origin(config.address, 100, 1);
        sm.event_state_transaction(origin_tx).unwrap();
        assert_eq!(transitions(&drain(&mut h.receivers[0])), vec![0]);
        let origin = (*sm.solid_state().unwrap()).clone();
        (sm, origin)
    }

    #[test]
    fn test_origin_built_locally() {
        let mut h = Harness::new(3);
        let (sm, origin) = at_origin(&mut h);
        assert_eq!(sm.solid_state_index(), Some(0));
        assert_eq!(origin.state_index(), 0);
        let stored = h.stores[0].load_batch(&config().address, 0).unwrap().unwrap();
        assert_eq!(stored.size(), 1);
    }

    #[test]
    fn test_applies_batch_once_anchor_evidenced() {
        let mut h = Harness::new(3);
        let (mut sm, origin) = at_origin(&mut h);
        let chain = chain(&origin, 1);

        sm.event_pending_batch(chain[0].1.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(0));
        // anchor unknown, so it is asked for
        assert_eq!(*h.ledger.requested.lock(), vec![chain[0].0.id()]);

        sm.event_state_transaction(chain[0].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(1));
        assert_eq!(transitions(&drain(&mut h.receivers[0])), vec![1]);
        assert!(h.stores[0].load_batch(&config().address, 1).unwrap().is_some());
        assert!(sm.pending_batches.is_empty());
    }

    #[test]
    fn test_never_skips_an_index() {
        let mut h = Harness::new(3);
        let (mut sm, origin) = at_origin(&mut h);
        let chain = chain(&origin, 3);

        // batches and anchors for 2 and 3 first, in any order
        sm.event_pending_batch(chain[2].1.clone()).unwrap();
        sm.event_state_transaction(chain[1].0.clone()).unwrap();
        sm.event_pending_batch(chain[1].1.clone()).unwrap();
        sm.event_state_transaction(chain[2].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(0));
        assert_eq!(sm.largest_evidenced_state_index(), Some(3));

        sm.event_pending_batch(chain[0].1.clone()).unwrap();
        sm.event_state_transaction(chain[0].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(1));

        // one step per action; the next anchor has to be evidenced again
        sm.event_state_transaction(chain[1].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(2));
        sm.event_state_transaction(chain[2].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(3));
        assert_eq!(transitions(&drain(&mut h.receivers[0])), vec![1, 2, 3]);
    }

    #[test]
    fn test_state_hash_mismatch_drops_batch() {
        let mut h = Harness::new(3);
        let (mut sm, origin) = at_origin(&mut h);
        let chain = chain(&origin, 1);
        let (tx, _) = &chain[0];
        // right anchor id, wrong content
        let forged = batch_for(1, 99).with_state_transaction(tx.id());

        sm.event_pending_batch(forged).unwrap();
        sm.event_state_transaction(tx.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(0));
        assert!(sm.pending_batches.is_empty());
    }

    #[test]
    fn test_missing_batch_requested_from_rotating_peers() {
        let mut h = Harness::new(3);
        let (mut sm, origin) = at_origin(&mut h);
        let chain = chain(&origin, 1);

        sm.event_state_transaction(chain[0].0.clone()).unwrap();
        sm.event_timer_tick(2).unwrap();

        let mut asked = Vec::new();
        for peer in 1..3 {
            for ev in drain(&mut h.receivers[peer]) {
                if let NodeEvent::Peer(bytes) = ev {
                    let msg = PeerMessage::from_bytes(&bytes).unwrap();
                    assert_eq!(msg.body, MessageBody::GetBatch);
                    assert_eq!(msg.state_index, 1);
                    asked.push(peer);
                }
            }
        }
        // one request per action, to different peers
        asked.sort();
        assert_eq!(asked, vec![1, 2]);
    }

    #[test]
    fn test_persisted_state_is_a_candidate() {
        let mut h = Harness::new(3);
        let (_, origin) = at_origin(&mut h);
        let chain = chain(&origin, 1);
        let next = origin.apply_batch(&chain[0].1).unwrap();
        h.stores[1].save_solid_state(&next).unwrap();

        let mut sm = h.state_manager(1, config());
        assert_eq!(sm.solid_state_index(), None);

        // an anchor for another index is out of sequence
        sm.event_state_transaction(StateTransaction::origin(config().address, 100, 1))
            .unwrap();
        assert_eq!(sm.solid_state_index(), None);

        sm.event_state_transaction(chain[0].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(1));
        assert_eq!(sm.solid_state().unwrap().hash(), next.hash());
    }

    fn get_batch_requests(h: &mut Harness) -> Vec<u32> {
        let mut out = Vec::new();
        for peer in 1..3 {
            for ev in drain(&mut h.receivers[peer]) {
                if let NodeEvent::Peer(bytes) = ev {
                    let msg = PeerMessage::from_bytes(&bytes).unwrap();
                    if msg.body == MessageBody::GetBatch {
                        out.push(msg.state_index);
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_sync_acts_on_divided_ticks_only() {
        let mut h = Harness::new(3);
        let (mut sm, origin) = at_origin(&mut h);
        let chain = chain(&origin, 1);
        sm.event_state_transaction(chain[0].0.clone()).unwrap();
        assert_eq!(get_batch_requests(&mut h), vec![1]);

        // default divisor is 2
        sm.event_timer_tick(1).unwrap();
        assert!(get_batch_requests(&mut h).is_empty());
        sm.event_timer_tick(3).unwrap();
        assert!(get_batch_requests(&mut h).is_empty());
        sm.event_timer_tick(4).unwrap();
        assert_eq!(get_batch_requests(&mut h), vec![1]);
    }

    #[test]
    fn test_persisted_state_behind_ledger_asks_for_its_anchor() {
        let mut h = Harness::new(3);
        let (_, origin) = at_origin(&mut h);
        let chain = chain(&origin, 2);
        let next = origin.apply_batch(&chain[0].1).unwrap();
        h.stores[1].save_batch(&config().address, &chain[0].1).unwrap();
        h.stores[1].save_solid_state(&next).unwrap();
        let mut sm = h.state_manager(1, config());

        // only the latest anchor is delivered
        sm.event_state_transaction(chain[1].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), None);
        sm.event_timer_tick(2).unwrap();
        assert_eq!(*h.ledger.requested.lock(), vec![chain[0].0.id()]);

        sm.event_state_transaction(chain[0].0.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(1));
        drain(&mut h.receivers[1]);

        // from there on the gap is filled from peers
        sm.event_timer_tick(2).unwrap();
        let mut asked = Vec::new();
        for peer in [0, 2] {
            for ev in drain(&mut h.receivers[peer]) {
                if let NodeEvent::Peer(bytes) = ev {
                    asked.push(PeerMessage::from_bytes(&bytes).unwrap());
                }
            }
        }
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].body, MessageBody::GetBatch);
        assert_eq!(asked[0].state_index, 2);
    }

    #[test]
    fn test_batch_that_cannot_be_stored_is_not_applied() {
        let mut h = Harness::new(3);
        let (mut sm, origin) = at_origin(&mut h);
        let chain = chain(&origin, 1);
        let (tx, batch) = &chain[0];
        // a different batch already occupies index 1
        let other = batch_for(1, 7).with_state_transaction(tx.id());
        h.stores[0].save_batch(&config().address, &other).unwrap();

        sm.event_pending_batch(batch.clone()).unwrap();
        sm.event_state_transaction(tx.clone()).unwrap();
        assert_eq!(sm.solid_state_index(), Some(0));
        assert!(sm.pending_batches.is_empty());
        assert!(transitions(&drain(&mut h.receivers[0])).is_empty());
    }
}
