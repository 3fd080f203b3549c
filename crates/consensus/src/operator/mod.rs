//! Operator - drives one round per state index
//!
//! Picks the leader, opens rounds over ready requests, dispatches execution
//! tasks, and either collects signature shares (leader) or sends its own share
//! to the leader (follower).

mod leader;
mod requests;
mod result;

use crate::committee::Committee;
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::ledger::LedgerClient;
use crate::messages::{EventSender, MessageBody};
use crate::permutation::PeerPermutation;
use crate::signer::ThresholdSigner;
use sc_state::{
    Batch, HashValue, Request, RequestId, StateTransaction, TaskRunner, VirtualState,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// A peer's signature share over a result transaction
#[derive(Debug, Clone)]
pub(crate) struct SignedResult {
    pub essence_hash: HashValue,
    pub sig_share: Vec<u8>,
}

/// Round bookkeeping while this node leads a state index
#[derive(Debug)]
pub(crate) struct LeaderStatus {
    pub batch_hash: HashValue,
    pub request_ids: Vec<RequestId>,
    pub timestamp: i64,
    /// Own unsigned result, once computed
    pub result_tx: Option<StateTransaction>,
    pub batch: Option<Batch>,
    /// Shares by peer index, own share included
    pub signed_results: HashMap<u16, SignedResult>,
    /// Full signature recovered and transaction posted
    pub finalized: bool,
}

impl LeaderStatus {
    fn new(batch_hash: HashValue, request_ids: Vec<RequestId>, timestamp: i64) -> Self {
        Self {
            batch_hash,
            request_ids,
            timestamp,
            result_tx: None,
            batch: None,
            signed_results: HashMap::new(),
            finalized: false,
        }
    }
}

pub struct Operator {
    committee: Arc<dyn Committee>,
    signer: Arc<dyn ThresholdSigner>,
    runner: Arc<dyn TaskRunner>,
    ledger: Arc<dyn LedgerClient>,
    events: EventSender,
    config: ConsensusConfig,

    /// Anchoring transaction of the current state
    state_tx: Option<StateTransaction>,
    current_state: Option<Arc<VirtualState>>,
    /// Known, not yet settled requests
    requests: BTreeMap<RequestId, Request>,

    peer_permutation: PeerPermutation,
    leader_status: Option<LeaderStatus>,
    leader_rotation_deadline: Option<Instant>,
    /// Batch hash already computed for each leader at the current state index
    computed_for_leader: HashMap<u16, HashValue>,
}

impl Operator {
    pub fn new(
        committee: Arc<dyn Committee>,
        signer: Arc<dyn ThresholdSigner>,
        runner: Arc<dyn TaskRunner>,
        ledger: Arc<dyn LedgerClient>,
        events: EventSender,
        config: ConsensusConfig,
    ) -> Result<Self, ConsensusError> {
        let own = committee.own_index();
        if own >= committee.size() || !committee.is_alive(own) {
            return Err(ConsensusError::invariant(format!(
                "own peer #{} must be a live committee member",
                own
            )));
        }
        let peer_permutation = PeerPermutation::new(committee.size());
        Ok(Self {
            committee,
            signer,
            runner,
            ledger,
            events,
            config,
            state_tx: None,
            current_state: None,
            requests: BTreeMap::new(),
            peer_permutation,
            leader_status: None,
            leader_rotation_deadline: None,
            computed_for_leader: HashMap::new(),
        })
    }

    /// Index of the state the current round builds on
    pub fn state_index(&self) -> Option<u32> {
        self.current_state.as_ref().map(|s| s.state_index())
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Solid state advanced: settle requests and start over with a new leader order
    pub fn event_state_transition(
        &mut self,
        state: Arc<VirtualState>,
        state_tx: StateTransaction,
    ) -> Result<(), ConsensusError> {
        for id in &state_tx.state_block().request_ids {
            self.requests.remove(id);
        }
        let seed = state_tx.id();
        tracing::info!(
            state_index = state.state_index(),
            state_hash = %state.hash(),
            state_tx = %seed,
            pending_requests = self.requests.len(),
            "State transition"
        );
        self.current_state = Some(state);
        self.state_tx = Some(state_tx);
        self.computed_for_leader.clear();
        let leader = self.reset_leader(seed.as_bytes())?;
        tracing::debug!(leader, "Leader for next round");
        self.take_action()
    }

    pub fn event_timer_tick(&mut self) -> Result<(), ConsensusError> {
        let due = self
            .leader_rotation_deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if due {
            let previous = self.peer_permutation.current();
            let leader = self.advance_leader()?;
            tracing::info!(previous, leader, state_index = ?self.state_index(), "Leader rotated");
        }
        self.repeat_announcement();
        self.take_action()
    }

    /// Followers still catching up drop the first announcement of a round
    fn repeat_announcement(&self) {
        let (Some(state_index), Some(ls)) = (self.state_index(), self.leader_status.as_ref()) else {
            return;
        };
        if ls.finalized || !self.is_self_leader() {
            return;
        }
        tracing::trace!(state_index, batch_hash = %ls.batch_hash, "Repeating StartProcessingBatch");
        self.committee.broadcast_msg(
            state_index,
            MessageBody::StartProcessingBatch {
                request_ids: ls.request_ids.clone(),
                timestamp: ls.timestamp,
            },
        );
    }

    /// Start a round if this node leads and has nothing in flight
    pub fn take_action(&mut self) -> Result<(), ConsensusError> {
        if self.current_state.is_none() {
            return Ok(());
        }
        if !self.has_ready_requests() {
            self.leader_rotation_deadline = None;
        } else if self.leader_rotation_deadline.is_none() {
            self.set_leader_rotation_deadline();
        }
        if self.is_self_leader() && self.leader_status.is_none() {
            self.start_round();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Mock collaborators shared by operator unit tests

    use super::*;
    use crate::committee::{LocalCommittee, LocalNetwork};
    use crate::messages::{event_channel, EventReceiver};
    use crate::signer::MultisigSigner;
    use parking_lot::Mutex;
    use sc_state::{InlineRunner, TransactionId};

    #[derive(Default)]
    pub struct RecordingLedger {
        pub posted: Mutex<Vec<StateTransaction>>,
        pub requested: Mutex<Vec<TransactionId>>,
    }

    impl LedgerClient for RecordingLedger {
        fn post_transaction(&self, tx: StateTransaction) {
            self.posted.lock().push(tx);
        }

        fn request_transaction(&self, tx_id: TransactionId) {
            self.requested.lock().push(tx_id);
        }
    }

    pub struct Harness {
        pub network: Arc<LocalNetwork>,
        pub receivers: Vec<EventReceiver>,
        pub senders: Vec<EventSender>,
        pub signers: Vec<MultisigSigner>,
        pub ledger: Arc<RecordingLedger>,
    }

    impl Harness {
        pub fn new(size: u16, quorum: u16) -> Self {
            let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| event_channel()).unzip();
            let network = LocalNetwork::new(senders.clone(), quorum);
            let signers = MultisigSigner::generate_committee(b"operator tests", size, quorum).unwrap();
            Self {
                network,
                receivers,
                senders,
                signers,
                ledger: Arc::new(RecordingLedger::default()),
            }
        }

        pub fn committee(&self, index: u16) -> LocalCommittee {
            self.network.member(index)
        }

        pub fn operator(&self, index: u16, config: ConsensusConfig) -> Operator {
            Operator::new(
                Arc::new(self.committee(index)),
                Arc::new(self.signers[index as usize].clone()),
                Arc::new(InlineRunner),
                self.ledger.clone(),
                self.senders[index as usize].clone(),
                config,
            )
            .unwrap()
        }
    }
}
