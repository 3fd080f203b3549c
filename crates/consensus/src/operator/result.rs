//! Execution results and signature share aggregation

use super::{Operator, SignedResult};
use crate::error::ConsensusError;
use crate::messages::{MessageBody, NodeEvent};
use sc_state::{hash_data, HashValue, VmResult};

impl Operator {
    pub fn event_result_calculated(&mut self, result: VmResult) -> Result<(), ConsensusError> {
        let task = &result.task;
        if self.state_index() != Some(task.state_index()) {
            tracing::debug!(
                result_state_index = task.state_index(),
                state_index = ?self.state_index(),
                "Stale execution result discarded"
            );
            return Ok(());
        }

        if task.leader_index == self.committee.own_index() {
            match &self.leader_status {
                Some(ls) if ls.batch_hash == task.batch_hash && ls.result_tx.is_none() => {}
                _ => {
                    tracing::debug!(batch_hash = %task.batch_hash, "Own result for a closed round discarded");
                    return Ok(());
                }
            }
            self.save_own_result(&result)?;
            return self.check_quorum();
        }

        if self.computed_for_leader.get(&task.leader_index) != Some(&task.batch_hash) {
            tracing::debug!(
                leader = task.leader_index,
                batch_hash = %task.batch_hash,
                "Result for a superseded round discarded"
            );
            return Ok(());
        }
        self.send_result_to_leader(&result);
        Ok(())
    }

    fn send_result_to_leader(&self, result: &VmResult) {
        let essence = result.result_tx.essence_bytes();
        let sig_share = match self.signer.sign_share(&essence) {
            Ok(share) => share,
            Err(e) => {
                tracing::error!("Error while signing transaction: {}", e);
                return;
            }
        };
        let essence_hash = hash_data(&[&essence]);
        let leader = result.task.leader_index;
        tracing::debug!(
            leader,
            batch_hash = %result.task.batch_hash,
            essence_hash = %essence_hash,
            ts = result.task.timestamp,
            "Sending result to the leader"
        );
        let body = MessageBody::SignedHash {
            batch_hash: result.task.batch_hash,
            orig_timestamp: result.task.timestamp,
            essence_hash,
            sig_share,
        };
        if let Err(e) = self.committee.send_msg(leader, result.task.state_index(), body) {
            tracing::warn!(leader, "Failed to send signed hash: {}", e);
        }
    }

    fn save_own_result(&mut self, result: &VmResult) -> Result<(), ConsensusError> {
        let own = self.committee.own_index();
        let Some(ls) = self.leader_status.as_mut() else {
            return Ok(());
        };

        let bh = result.computed_batch_hash();
        if bh != ls.batch_hash {
            return Err(ConsensusError::invariant(format!(
                "own result batch hash {} differs from round batch hash {}",
                bh, ls.batch_hash
            )));
        }
        if result.task.requests.len() != result.batch.size() as usize {
            return Err(ConsensusError::invariant(format!(
                "{} requests produced a batch of size {}",
                result.task.requests.len(),
                result.batch.size()
            )));
        }

        let essence = result.result_tx.essence_bytes();
        let sig_share = match self.signer.sign_share(&essence) {
            Ok(share) => share,
            Err(e) => {
                tracing::error!("Error while signing transaction: {}", e);
                return Ok(());
            }
        };
        let essence_hash = hash_data(&[&essence]);
        tracing::debug!(
            batch_hash = %bh,
            ts = result.task.timestamp,
            essence_hash = %essence_hash,
            "Own result saved"
        );

        ls.result_tx = Some(result.result_tx.clone());
        ls.batch = Some(result.batch.clone());
        ls.signed_results.insert(
            own,
            SignedResult {
                essence_hash,
                sig_share,
            },
        );
        Ok(())
    }

    pub fn event_signed_hash(
        &mut self,
        sender: u16,
        state_index: u32,
        batch_hash: HashValue,
        orig_timestamp: i64,
        essence_hash: HashValue,
        sig_share: Vec<u8>,
    ) -> Result<(), ConsensusError> {
        if self.state_index() != Some(state_index) || !self.is_self_leader() {
            tracing::debug!(sender, state_index, "SignedHash for a round this node does not lead");
            return Ok(());
        }
        let own = self.committee.own_index();
        let Some(ls) = self.leader_status.as_mut() else {
            return Ok(());
        };
        if ls.batch_hash != batch_hash || ls.timestamp != orig_timestamp {
            tracing::debug!(sender, batch_hash = %batch_hash, "SignedHash for another batch ignored");
            return Ok(());
        }
        if ls.finalized {
            return Ok(());
        }
        if let Some(mine) = ls.signed_results.get(&own) {
            if mine.essence_hash != essence_hash {
                tracing::warn!(
                    sender,
                    own = %mine.essence_hash,
                    received = %essence_hash,
                    "Essence hash mismatch, share excluded from quorum"
                );
                return Ok(());
            }
        }
        ls.signed_results.insert(
            sender,
            SignedResult {
                essence_hash,
                sig_share,
            },
        );
        self.check_quorum()
    }

    /// Finalize the round once T shares agree with the own result
    fn check_quorum(&mut self) -> Result<(), ConsensusError> {
        let own = self.committee.own_index();
        let quorum = self.committee.quorum() as usize;
        let Some(ls) = self.leader_status.as_mut() else {
            return Ok(());
        };
        if ls.finalized {
            return Ok(());
        }
        let (Some(result_tx), Some(own_essence)) = (
            ls.result_tx.as_ref(),
            ls.signed_results.get(&own).map(|s| s.essence_hash),
        ) else {
            return Ok(());
        };

        let mut shares = Vec::with_capacity(ls.signed_results.len());
        for (peer, signed) in &ls.signed_results {
            if signed.essence_hash == own_essence {
                shares.push(signed.sig_share.clone());
            } else {
                tracing::warn!(peer, "Early share with a different essence hash not counted");
            }
        }
        if shares.len() < quorum {
            tracing::debug!(have = shares.len(), need = quorum, "Quorum not reached yet");
            return Ok(());
        }

        let essence = result_tx.essence_bytes();
        let signature = match self.signer.recover_full_signature(&shares, &essence) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(batch_hash = %ls.batch_hash, "Could not recover full signature: {}", e);
                return Ok(());
            }
        };

        let mut tx = result_tx.clone();
        tx.put_signature(signature);
        let tx_id = tx.id();
        let Some(batch) = ls.batch.clone() else {
            return Err(ConsensusError::invariant("result transaction saved without its batch"));
        };
        let batch = batch.with_state_transaction(tx_id);
        ls.finalized = true;

        tracing::info!(
            state_index = tx.state_index(),
            state_tx = %tx_id,
            shares = shares.len(),
            "Round finalized, posting anchoring transaction"
        );
        if self.events.send(NodeEvent::PendingBatch(batch)).is_err() {
            tracing::debug!("Event queue closed, finalized batch not queued");
        }
        self.ledger.post_transaction(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Harness;
    use crate::config::ConsensusConfig;
    use crate::error::ConsensusError;
    use crate::messages::{EventReceiver, MessageBody, NodeEvent, PeerMessage};
    use crate::operator::Operator;
    use crate::signer::ThresholdSigner;
    use sc_state::{
        hash_data, Address, Batch, HashValue, Request, RequestCode, RequestId, StateTransaction,
        VirtualState, VmResult,
    };
    use std::sync::Arc;

    fn request() -> Request {
        Request {
            id: RequestId::new(HashValue([7; 32]), 0),
            sender: Address::from_seed("user"),
            code: RequestCode::SET_VARS,
            args: vec![("x".into(), vec![1])],
            deposit: 0,
            timelock: 0,
        }
    }

    fn result_of(rx: &mut EventReceiver) -> VmResult {
        loop {
            match rx.try_recv() {
                Ok(NodeEvent::ResultCalculated(res)) => return *res,
                Ok(_) => continue,
                Err(e) => panic!("no result: {:?}", e),
            }
        }
    }

    /// 4 peers, T = 3; the leader's own result is computed but not yet handled
    fn setup_unsaved() -> (Harness, Vec<Operator>, u16, VmResult) {
        let mut h = Harness::new(4, 3);
        let config = ConsensusConfig::default();
        let tx = StateTransaction::origin(config.address, 10, 1);
        let state = Arc::new(VirtualState::origin(config.address, &Batch::origin(1)).unwrap());
        let mut ops: Vec<Operator> = (0..4).map(|i| h.operator(i, config.clone())).collect();
        for op in ops.iter_mut() {
            op.event_request(request()).unwrap();
            op.event_state_transition(state.clone(), tx.clone()).unwrap();
        }
        let leader = ops[0].current_leader().0;
        let res = result_of(&mut h.receivers[leader as usize]);
        (h, ops, leader, res)
    }

    fn setup() -> (Harness, Vec<Operator>, u16) {
        let (h, mut ops, leader, res) = setup_unsaved();
        ops[leader as usize].event_result_calculated(res).unwrap();
        (h, ops, leader)
    }

    /// Share of a follower over the leader's exact result
    fn follower_share(h: &Harness, ops: &[Operator], leader: u16, follower: u16) -> (HashValue, i64, HashValue, Vec<u8>) {
        let ls = ops[leader as usize].leader_status.as_ref().unwrap();
        let essence = ls.result_tx.as_ref().unwrap().essence_bytes();
        let share = h.signers[follower as usize].sign_share(&essence).unwrap();
        (ls.batch_hash, ls.timestamp, hash_data(&[&essence]), share)
    }

    #[test]
    fn test_quorum_reached_with_matching_shares() {
        let (h, mut ops, leader) = setup();
        let followers: Vec<u16> = (0..4).filter(|&i| i != leader).collect();

        let (bh, ts, eh, share) = follower_share(&h, &ops, leader, followers[0]);
        ops[leader as usize]
            .event_signed_hash(followers[0], 0, bh, ts, eh, share)
            .unwrap();
        assert!(h.ledger.posted.lock().is_empty());

        let (bh, ts, eh, share) = follower_share(&h, &ops, leader, followers[1]);
        ops[leader as usize]
            .event_signed_hash(followers[1], 0, bh, ts, eh, share)
            .unwrap();

        let posted = h.ledger.posted.lock();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].is_signed());
        assert_eq!(posted[0].state_index(), 1);
        assert!(ops[leader as usize].leader_status.as_ref().unwrap().finalized);
    }

    #[test]
    fn test_mismatched_essence_excluded() {
        let (h, mut ops, leader) = setup();
        let followers: Vec<u16> = (0..4).filter(|&i| i != leader).collect();

        // a divergent peer signs something else
        let (bh, ts, _, _) = follower_share(&h, &ops, leader, followers[0]);
        let bogus = b"divergent essence";
        let share = h.signers[followers[0] as usize].sign_share(bogus).unwrap();
        ops[leader as usize]
            .event_signed_hash(followers[0], 0, bh, ts, hash_data(&[bogus]), share)
            .unwrap();

        let (bh, ts, eh, share) = follower_share(&h, &ops, leader, followers[1]);
        ops[leader as usize]
            .event_signed_hash(followers[1], 0, bh, ts, eh, share)
            .unwrap();
        // own + one matching share is below T
        assert!(h.ledger.posted.lock().is_empty());

        let (bh, ts, eh, share) = follower_share(&h, &ops, leader, followers[2]);
        ops[leader as usize]
            .event_signed_hash(followers[2], 0, bh, ts, eh, share)
            .unwrap();
        assert_eq!(h.ledger.posted.lock().len(), 1);
    }

    #[test]
    fn test_invalid_share_keeps_round_open() {
        let (h, mut ops, leader) = setup();
        let followers: Vec<u16> = (0..4).filter(|&i| i != leader).collect();

        let (bh, ts, eh, _) = follower_share(&h, &ops, leader, followers[0]);
        ops[leader as usize]
            .event_signed_hash(followers[0], 0, bh, ts, eh, vec![0; 10])
            .unwrap();
        let (bh, ts, eh, share) = follower_share(&h, &ops, leader, followers[1]);
        ops[leader as usize]
            .event_signed_hash(followers[1], 0, bh, ts, eh, share)
            .unwrap();
        assert!(h.ledger.posted.lock().is_empty());
        assert!(!ops[leader as usize].leader_status.as_ref().unwrap().finalized);

        // a replacement share completes the quorum
        let (bh, ts, eh, share) = follower_share(&h, &ops, leader, followers[0]);
        ops[leader as usize]
            .event_signed_hash(followers[0], 0, bh, ts, eh, share)
            .unwrap();
        assert_eq!(h.ledger.posted.lock().len(), 1);
    }

    #[test]
    fn test_follower_sends_share_to_leader() {
        let (mut h, mut ops, leader) = setup();
        let follower = (leader + 1) % 4;

        // the announcement is the first thing in the follower's queue
        let msg = match h.receivers[follower as usize].try_recv().unwrap() {
            NodeEvent::Peer(bytes) => PeerMessage::from_bytes(&bytes).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let MessageBody::StartProcessingBatch { request_ids, timestamp } = msg.body else {
            panic!("expected StartProcessingBatch");
        };
        ops[follower as usize]
            .event_start_processing_batch(leader, 0, request_ids, timestamp)
            .unwrap();
        let res = result_of(&mut h.receivers[follower as usize]);
        ops[follower as usize].event_result_calculated(res).unwrap();

        let msg = loop {
            match h.receivers[leader as usize].try_recv().unwrap() {
                NodeEvent::Peer(bytes) => break PeerMessage::from_bytes(&bytes).unwrap(),
                _ => continue,
            }
        };
        assert_eq!(msg.sender_index, follower);
        let MessageBody::SignedHash { batch_hash, essence_hash, .. } = msg.body else {
            panic!("expected SignedHash");
        };
        let ls = ops[leader as usize].leader_status.as_ref().unwrap();
        assert_eq!(batch_hash, ls.batch_hash);
        assert_eq!(essence_hash, ls.result_tx.as_ref().unwrap().essence_hash());
    }

    #[test]
    fn test_own_result_batch_hash_mismatch_is_fatal() {
        let (_h, mut ops, leader, mut res) = setup_unsaved();
        // dispatched for the open round but executed with another timestamp
        res.task.timestamp += 1;
        let err = ops[leader as usize].event_result_calculated(res).unwrap_err();
        assert!(matches!(err, ConsensusError::Invariant(_)));
    }

    #[test]
    fn test_stale_result_discarded() {
        let (_h, mut ops, leader, res) = setup_unsaved();
        ops[leader as usize].advance_leader().unwrap();
        // round closed by rotation, result dropped silently
        ops[leader as usize].event_result_calculated(res).unwrap();
        assert!(ops[leader as usize].leader_status.is_none());
    }

    #[test]
    fn test_shares_for_other_state_indices_ignored() {
        let (h, mut ops, leader) = setup();
        let followers: Vec<u16> = (0..4).filter(|&i| i != leader).collect();

        // valid shares over the open round, tagged with a neighbouring index
        for (&follower, state_index) in followers.iter().zip([1u32, u32::MAX]) {
            let (bh, ts, eh, share) = follower_share(&h, &ops, leader, follower);
            ops[leader as usize]
                .event_signed_hash(follower, state_index, bh, ts, eh, share)
                .unwrap();
        }
        let ls = ops[leader as usize].leader_status.as_ref().unwrap();
        assert_eq!(ls.signed_results.len(), 1);
        assert!(!ls.finalized);
        assert!(h.ledger.posted.lock().is_empty());

        // the same shares at the led index complete the round
        for &follower in &followers[..2] {
            let (bh, ts, eh, share) = follower_share(&h, &ops, leader, follower);
            ops[leader as usize]
                .event_signed_hash(follower, 0, bh, ts, eh, share)
                .unwrap();
        }
        assert_eq!(h.ledger.posted.lock().len(), 1);
    }
}
