//! Deterministic multi-node scenarios
//!
//! Every node gets an unbounded queue which the cluster drains by hand, an
//! inline task runner and an in-memory store. The mock ledger confirms posted
//! transactions immediately and fans them out to every queue. Dead peers have
//! their queues dropped on the floor.


use crate::committee::LocalNetwork;
use crate::config::ConsensusConfig;
use crate::ledger::LedgerClient;
use crate::messages::{event_channel, EventReceiver, EventSender, NodeEvent};
use crate::node::Node;
use crate::operator::Operator;
use crate::signer::{MultisigSigner, ThresholdSigner};
use crate::statemgr::StateManager;
use parking_lot::Mutex;
use sc_state::{
    Address, HashValue, InlineRunner, MemoryBatchStore, Request, RequestCode, RequestId,
    StateTransaction, TransactionId,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MockLedger {
    verifier: MultisigSigner,
    confirmed: Mutex<Vec<StateTransaction>>,
    subscribers: Vec<EventSender>,
}

impl MockLedger {
    fn new(verifier: MultisigSigner, subscribers: Vec<EventSender>) -> Self {
        Self {
            verifier,
            confirmed: Mutex::new(Vec::new()),
            subscribers,
        }
    }

    fn publish(&self, make: impl Fn() -> NodeEvent) {
        for s in &self.subscribers {
            let _ = s.send(make());
        }
    }

    pub fn confirm_origin(&self, tx: StateTransaction) {
        self.confirmed.lock().push(tx.clone());
        self.publish(|| NodeEvent::StateTransaction(tx.clone()));
    }

    pub fn post_request(&self, req: Request) {
        self.publish(|| NodeEvent::Request(req.clone()));
    }

    pub fn confirmed(&self) -> Vec<StateTransaction> {
        self.confirmed.lock().clone()
    }

    /// Redeliver the latest confirmed transaction to one queue
    pub fn replay_latest(&self, to: &EventSender) {
        if let Some(tx) = self.confirmed.lock().last().cloned() {
            let _ = to.send(NodeEvent::StateTransaction(tx));
        }
    }
}

impl LedgerClient for MockLedger {
    fn post_transaction(&self, tx: StateTransaction) {
        let Some(sig) = tx.signature.as_deref() else {
            return;
        };
        if self.verifier.verify_full_signature(sig, &tx.essence_bytes()).is_err() {
            return;
        }
        {
            let mut confirmed = self.confirmed.lock();
            let last = confirmed.last().map(|t| t.state_index());
            if last.map(|i| i + 1) != Some(tx.state_index()) {
                return;
            }
            confirmed.push(tx.clone());
        }
        self.publish(|| NodeEvent::StateTransaction(tx.clone()));
    }

    fn request_transaction(&self, tx_id: TransactionId) {
        let found = self.confirmed.lock().iter().find(|t| t.id() == tx_id).cloned();
        if let Some(tx) = found {
            self.publish(|| NodeEvent::StateTransaction(tx.clone()));
        }
    }
}

pub struct Cluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<Node>,
    pub receivers: Vec<EventReceiver>,
    pub senders: Vec<EventSender>,
    pub stores: Vec<Arc<MemoryBatchStore>>,
    pub signers: Vec<MultisigSigner>,
    pub ledger: Arc<MockLedger>,
    pub config: ConsensusConfig,
}

pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        address: Address::from_seed("scenario contract"),
        owner_address: Address::from_seed("scenario owner"),
        sync_retry_period: Duration::ZERO,
        sync_tick_divisor: 1,
        ..Default::default()
    }
}

pub fn set_request(n: u8, key: &str, value: &[u8]) -> Request {
    Request {
        id: RequestId::new(HashValue([n; 32]), 0),
        sender: Address::from_seed("client"),
        code: RequestCode::SET_VARS,
        args: vec![(key.to_string(), value.to_vec())],
        deposit: 1,
        timelock: 0,
    }
}

impl Cluster {
    pub fn new(size: u16, quorum: u16, config: ConsensusConfig) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| event_channel()).unzip();
        let network = LocalNetwork::new(senders.clone(), quorum);
        let signers = MultisigSigner::generate_committee(b"scenario committee", size, quorum).unwrap();
        let verifier = MultisigSigner::verifier(signers[0].public_keys(), quorum).unwrap();
        let ledger = Arc::new(MockLedger::new(verifier, senders.clone()));
        let stores: Vec<_> = (0..size).map(|_| Arc::new(MemoryBatchStore::new())).collect();

        let mut cluster = Self {
            network,
            nodes: Vec::new(),
            receivers,
            senders,
            stores,
            signers,
            ledger,
            config,
        };
        cluster.nodes = (0..size).map(|i| cluster.build_node(i)).collect();
        cluster
    }

    pub fn build_node(&self, index: u16) -> Node {
        let i = index as usize;
        let committee = Arc::new(self.network.member(index));
        let operator = Operator::new(
            committee.clone(),
            Arc::new(self.signers[i].clone()),
            Arc::new(InlineRunner),
            self.ledger.clone(),
            self.senders[i].clone(),
            self.config.clone(),
        )
        .unwrap();
        let state_mgr = StateManager::new(
            committee.clone(),
            self.stores[i].clone(),
            self.ledger.clone(),
            self.senders[i].clone(),
            self.config.clone(),
        )
        .unwrap();
        Node::new(index, self.network.size(), operator, state_mgr, self.config.clone())
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Confirm the origin transaction and let every node build state #0
    pub fn bootstrap(&mut self) -> StateTransaction {
        let origin = StateTransaction::origin(self.config.address, 1_000, 1);
        self.ledger.confirm_origin(origin.clone());
        self.run_until_quiet();
        origin
    }

    /// Deliver queued events until no queue has anything left
    pub fn run_until_quiet(&mut self) {
        for _ in 0..10_000 {
            let mut progressed = false;
            for i in 0..self.size() {
                while let Ok(ev) = self.receivers[i].try_recv() {
                    progressed = true;
                    if !self.network.is_alive(i as u16) {
                        continue;
                    }
                    self.nodes[i].handle(ev).unwrap();
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("cluster does not quiesce");
    }

    pub fn tick_all(&mut self) {
        for i in 0..self.size() {
            if self.network.is_alive(i as u16) {
                self.nodes[i].tick().unwrap();
            }
        }
    }

    /// Alternate delivery and ticks until every alive node reaches the index
    pub fn settle(&mut self, state_index: u32, max_ticks: usize) {
        for _ in 0..max_ticks {
            self.run_until_quiet();
            if self.alive_at(state_index) {
                return;
            }
            self.tick_all();
        }
        panic!(
            "cluster did not reach state #{}: {:?}",
            state_index,
            self.state_indices()
        );
    }

    pub fn alive_at(&self, state_index: u32) -> bool {
        (0..self.size())
            .filter(|&i| self.network.is_alive(i as u16))
            .all(|i| self.nodes[i].state_manager().solid_state_index() == Some(state_index))
    }

    pub fn state_indices(&self) -> Vec<Option<u32>> {
        self.nodes
            .iter()
            .map(|n| n.state_manager().solid_state_index())
            .collect()
    }

    pub fn state_hashes(&self) -> Vec<Option<HashValue>> {
        self.nodes
            .iter()
            .map(|n| n.state_manager().solid_state().map(|s| s.hash()))
            .collect()
    }

    pub fn leader(&self) -> u16 {
        self.nodes[0].operator().current_leader().0
    }
}
