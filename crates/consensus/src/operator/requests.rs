//! Request intake, round start and task dispatch

use super::{LeaderStatus, Operator};
use crate::error::ConsensusError;
use crate::messages::{MessageBody, NodeEvent};
use sc_state::{batch_hash, entropy_from, HashValue, Request, RequestId, TaskCallback, VmTask};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Wall clock in unix nanoseconds
pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl Operator {
    pub fn event_request(&mut self, req: Request) -> Result<(), ConsensusError> {
        if self.requests.contains_key(&req.id) {
            return Ok(());
        }
        tracing::debug!(
            request = %req.id,
            code = ?req.code,
            deposit = req.deposit,
            timelock = req.timelock,
            "New request"
        );
        self.requests.insert(req.id, req);
        self.take_action()
    }

    /// Whether any known request could go into a batch right now
    pub(crate) fn has_ready_requests(&self) -> bool {
        let now_secs = now_nanos() / NANOS_PER_SEC;
        self.requests.values().any(|r| r.is_ready(now_secs))
    }

    /// Requests ready at the given time, in id order, at most one batch worth
    fn ready_requests(&self, timestamp: i64) -> Vec<Request> {
        let now_secs = timestamp / NANOS_PER_SEC;
        self.requests
            .values()
            .filter(|r| r.is_ready(now_secs))
            .take(self.config.max_batch_size)
            .cloned()
            .collect()
    }

    /// Open a round as leader: announce it and compute it locally
    pub(crate) fn start_round(&mut self) {
        let Some(state) = self.current_state.clone() else {
            return;
        };
        // strictly after the state being built upon
        let timestamp = now_nanos().max(state.timestamp() + 1);
        let requests = self.ready_requests(timestamp);
        if requests.is_empty() {
            return;
        }
        let own = self.committee.own_index();
        let request_ids: Vec<RequestId> = requests.iter().map(|r| r.id).collect();
        let bh = batch_hash(&request_ids, timestamp, own);

        tracing::info!(
            state_index = state.state_index(),
            batch_hash = %bh,
            requests = request_ids.len(),
            "Starting round as leader"
        );
        self.leader_status = Some(LeaderStatus::new(bh, request_ids.clone(), timestamp));
        let sent = self.committee.broadcast_msg(
            state.state_index(),
            MessageBody::StartProcessingBatch {
                request_ids,
                timestamp,
            },
        );
        tracing::debug!("StartProcessingBatch sent to {} peers", sent);
        self.run_calculations_async(requests, own, timestamp, bh);
    }

    pub fn event_start_processing_batch(
        &mut self,
        sender: u16,
        state_index: u32,
        request_ids: Vec<RequestId>,
        timestamp: i64,
    ) -> Result<(), ConsensusError> {
        if self.state_index() != Some(state_index) {
            tracing::debug!(
                sender,
                state_index,
                own_state_index = ?self.state_index(),
                "StartProcessingBatch for another state index, ignored"
            );
            return Ok(());
        }
        if sender == self.committee.own_index() {
            return Ok(());
        }
        let (leader, _) = self.current_leader();
        if sender != leader {
            // views of liveness may differ for a while; the round is keyed by its leader anyway
            tracing::debug!(sender, leader, "StartProcessingBatch from a peer which is not the current leader");
        }

        let bh = batch_hash(&request_ids, timestamp, sender);
        if self.computed_for_leader.get(&sender) == Some(&bh) {
            tracing::debug!(sender, batch_hash = %bh, "Batch already computed for this leader");
            return Ok(());
        }

        let now_secs = timestamp / NANOS_PER_SEC;
        let mut requests = Vec::with_capacity(request_ids.len());
        for id in &request_ids {
            match self.requests.get(id) {
                Some(req) if req.is_ready(now_secs) => requests.push(req.clone()),
                Some(_) => {
                    tracing::warn!(sender, request = %id, "StartProcessingBatch: request not ready, batch rejected");
                    return Ok(());
                }
                None => {
                    tracing::warn!(sender, request = %id, "StartProcessingBatch: unknown request, batch rejected");
                    return Ok(());
                }
            }
        }
        if requests.is_empty() {
            tracing::warn!(sender, "StartProcessingBatch: empty batch rejected");
            return Ok(());
        }

        self.computed_for_leader.insert(sender, bh);
        self.run_calculations_async(requests, sender, timestamp, bh);
        Ok(())
    }

    /// Hand a task over to the runner; the result comes back as an event
    fn run_calculations_async(
        &mut self,
        requests: Vec<Request>,
        leader_index: u16,
        timestamp: i64,
        bh: HashValue,
    ) {
        let (Some(state), Some(state_tx)) = (self.current_state.clone(), self.state_tx.as_ref()) else {
            tracing::debug!("run_calculations_async: current state is not known");
            return;
        };
        let now_secs = timestamp / NANOS_PER_SEC;
        if requests.iter().any(|r| !r.is_ready(now_secs)) {
            tracing::error!(batch_hash = %bh, "run_calculations_async: some requests are not ready");
            return;
        }

        let task = VmTask {
            leader_index,
            program_hash: self.config.program_hash,
            address: self.config.address,
            entropy: entropy_from(&state_tx.id()),
            balance: state_tx.essence.balance,
            owner_address: self.config.owner_address,
            reward_address: self.config.reward_address,
            minimum_reward: self.config.minimum_reward,
            requests,
            timestamp,
            virtual_state: state,
            batch_hash: bh,
        };

        let events = self.events.clone();
        let on_finish: TaskCallback = Box::new(move |result| match result {
            Ok(res) => {
                if events.send(NodeEvent::ResultCalculated(Box::new(res))).is_err() {
                    tracing::debug!("Node stopped before the execution result arrived");
                }
            }
            Err(e) => tracing::warn!(batch_hash = %bh, "Execution task failed: {}", e),
        });
        if let Err(e) = self.runner.submit(task, on_finish) {
            tracing::warn!(batch_hash = %bh, "Execution task rejected: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Harness;
    use crate::config::ConsensusConfig;
    use crate::messages::{MessageBody, NodeEvent, PeerMessage};
    use sc_state::{
        Address, Batch, HashValue, Request, RequestCode, RequestId, StateTransaction, VirtualState,
    };
    use std::sync::Arc;

    fn request(n: u8, timelock: u32) -> Request {
        Request {
            id: RequestId::new(HashValue([n; 32]), 0),
            sender: Address::from_seed("user"),
            code: RequestCode::SET_VARS,
            args: vec![(format!("k{}", n), vec![n])],
            deposit: 0,
            timelock,
        }
    }

    fn origin(address: Address) -> (Arc<VirtualState>, StateTransaction) {
        let tx = StateTransaction::origin(address, 10, 1);
        let state = VirtualState::origin(address, &Batch::origin(1)).unwrap();
        (Arc::new(state), tx)
    }

    #[test]
    fn test_leader_announces_and_computes() {
        let mut h = Harness::new(3, 2);
        let config = ConsensusConfig::default();
        let (state, tx) = origin(config.address);

        let mut ops: Vec<_> = (0..3).map(|i| h.operator(i, config.clone())).collect();
        for op in ops.iter_mut() {
            op.event_request(request(1, 0)).unwrap();
        }
        for op in ops.iter_mut() {
            op.event_state_transition(state.clone(), tx.clone()).unwrap();
        }
        let leader = ops[0].current_leader().0;
        assert!(ops[leader as usize].leader_status.is_some());

        // leader computed its own result
        let rx = &mut h.receivers[leader as usize];
        assert!(matches!(rx.try_recv(), Ok(NodeEvent::ResultCalculated(_))));

        // every follower got the announcement
        for (i, rx) in h.receivers.iter_mut().enumerate() {
            if i as u16 == leader {
                continue;
            }
            match rx.try_recv() {
                Ok(NodeEvent::Peer(bytes)) => {
                    let msg = PeerMessage::from_bytes(&bytes).unwrap();
                    assert_eq!(msg.sender_index, leader);
                    assert_eq!(msg.state_index, 0);
                    assert!(matches!(msg.body, MessageBody::StartProcessingBatch { .. }));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_time_locked_requests_wait() {
        let mut h = Harness::new(1, 1);
        let config = ConsensusConfig::default();
        let (state, tx) = origin(config.address);
        let mut op = h.operator(0, config);
        op.event_request(request(1, u32::MAX)).unwrap();
        op.event_state_transition(state, tx).unwrap();
        assert!(op.leader_status.is_none());
        assert!(h.receivers[0].try_recv().is_err());
        assert_eq!(op.pending_requests(), 1);
    }

    #[test]
    fn test_follower_rejects_unknown_requests_and_dedupes() {
        let mut h = Harness::new(2, 2);
        let config = ConsensusConfig::default();
        let (state, tx) = origin(config.address);
        let mut ops: Vec<_> = (0..2).map(|i| h.operator(i, config.clone())).collect();
        for op in ops.iter_mut() {
            op.event_state_transition(state.clone(), tx.clone()).unwrap();
        }
        let leader = ops[0].current_leader().0;
        let follower = 1 - leader as usize;
        let op = &mut ops[follower];

        let ids = vec![request(1, 0).id];
        op.event_start_processing_batch(leader, 0, ids.clone(), 5).unwrap();
        assert!(h.receivers[follower].try_recv().is_err());

        op.event_request(request(1, 0)).unwrap();
        op.event_start_processing_batch(leader, 0, ids.clone(), 5).unwrap();
        assert!(matches!(
            h.receivers[follower].try_recv(),
            Ok(NodeEvent::ResultCalculated(_))
        ));

        // same round again is not recomputed
        op.event_start_processing_batch(leader, 0, ids.clone(), 5).unwrap();
        assert!(h.receivers[follower].try_recv().is_err());

        // wrong state index is ignored
        op.event_start_processing_batch(leader, 3, ids, 6).unwrap();
        assert!(h.receivers[follower].try_recv().is_err());
    }
}
