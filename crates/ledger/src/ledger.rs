//! In-memory ledger
//!
//! Confirms anchoring transactions only if they continue the chain by exactly
//! one state index and carry a valid full signature of the committee. Every
//! confirmed transaction and every posted request is fanned out to all
//! connected members.

use crate::error::LedgerError;
use parking_lot::RwLock;
use sc_consensus::{EventSender, LedgerClient, NodeEvent, ThresholdSigner};
use sc_state::{Address, Request, RequestId, StateTransaction, TransactionId};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct LedgerInner {
    /// Confirmed chain, position equals state index
    transactions: Vec<StateTransaction>,
    /// Posted and not yet settled
    requests: BTreeMap<RequestId, Request>,
    settled: HashSet<RequestId>,
    subscribers: Vec<EventSender>,
}

impl LedgerInner {
    /// Send to every live subscriber, forgetting closed queues
    fn publish(&mut self, event: impl Fn() -> NodeEvent) {
        self.subscribers.retain(|s| s.send(event()).is_ok());
    }
}

/// Ledger of one smart contract address
pub struct InMemoryLedger {
    address: Address,
    verifier: Arc<dyn ThresholdSigner>,
    inner: RwLock<LedgerInner>,
}

impl InMemoryLedger {
    pub fn new(address: Address, verifier: Arc<dyn ThresholdSigner>) -> Arc<Self> {
        Arc::new(Self {
            address,
            verifier,
            inner: RwLock::new(LedgerInner::default()),
        })
    }

    /// Connect a member's event queue.
    ///
    /// The latest confirmed transaction and all unsettled requests are
    /// delivered right away.
    pub fn connect(self: &Arc<Self>, events: EventSender) -> LedgerConnection {
        let mut inner = self.inner.write();
        let mut replay: Vec<NodeEvent> = inner
            .transactions
            .last()
            .cloned()
            .map(NodeEvent::StateTransaction)
            .into_iter()
            .collect();
        replay.extend(inner.requests.values().cloned().map(NodeEvent::Request));
        if replay.into_iter().all(|ev| events.send(ev).is_ok()) {
            inner.subscribers.push(events.clone());
        } else {
            tracing::debug!("Event queue closed while connecting, not subscribed");
        }
        LedgerConnection {
            ledger: self.clone(),
            events,
        }
    }

    /// Confirm the unsigned transaction creating state #0
    pub fn post_origin(&self, tx: StateTransaction) -> Result<TransactionId, LedgerError> {
        if tx.essence.address != self.address {
            return Err(LedgerError::WrongAddress);
        }
        if tx.state_index() != sc_state::ORIGIN_STATE_INDEX {
            return Err(LedgerError::NotOrigin(tx.state_index()));
        }
        let mut inner = self.inner.write();
        if !inner.transactions.is_empty() {
            return Err(LedgerError::OriginExists);
        }
        let id = tx.id();
        tracing::info!(address = %self.address, tx = %id, "Origin confirmed");
        inner.transactions.push(tx.clone());
        inner.publish(|| NodeEvent::StateTransaction(tx.clone()));
        Ok(id)
    }

    /// Post a request to the contract
    pub fn post_request(&self, req: Request) -> Result<(), LedgerError> {
        let mut inner = self.inner.write();
        if inner.requests.contains_key(&req.id) || inner.settled.contains(&req.id) {
            return Err(LedgerError::DuplicateRequest(req.id.to_string()));
        }
        tracing::debug!(request = %req.id, code = ?req.code, "Request posted");
        inner.requests.insert(req.id, req.clone());
        inner.publish(|| NodeEvent::Request(req.clone()));
        Ok(())
    }

    /// Confirm a fully signed anchoring transaction
    pub fn confirm(&self, tx: StateTransaction) -> Result<TransactionId, LedgerError> {
        if tx.essence.address != self.address {
            return Err(LedgerError::WrongAddress);
        }
        let signature = tx.signature.as_deref().ok_or(LedgerError::Unsigned)?;
        self.verifier
            .verify_full_signature(signature, &tx.essence_bytes())
            .map_err(|e| LedgerError::BadSignature(e.to_string()))?;

        let mut inner = self.inner.write();
        let expected = inner.transactions.len() as u32;
        if inner.transactions.is_empty() || tx.state_index() != expected {
            return Err(LedgerError::OutOfOrder {
                expected,
                got: tx.state_index(),
            });
        }
        for id in &tx.state_block().request_ids {
            inner.requests.remove(id);
            inner.settled.insert(*id);
        }
        let id = tx.id();
        tracing::info!(
            state_index = tx.state_index(),
            state_hash = %tx.state_block().state_hash,
            requests = tx.state_block().request_ids.len(),
            tx = %id,
            "Anchoring transaction confirmed"
        );
        inner.transactions.push(tx.clone());
        inner.publish(|| NodeEvent::StateTransaction(tx.clone()));
        Ok(id)
    }

    pub fn latest(&self) -> Option<StateTransaction> {
        self.inner.read().transactions.last().cloned()
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<StateTransaction> {
        self.inner
            .read()
            .transactions
            .iter()
            .find(|tx| tx.id() == *id)
            .cloned()
    }

    /// State index of the latest confirmed transaction
    pub fn state_index(&self) -> Option<u32> {
        self.inner.read().transactions.last().map(|tx| tx.state_index())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.read().requests.len()
    }
}

/// One member's handle on the ledger
pub struct LedgerConnection {
    ledger: Arc<InMemoryLedger>,
    events: EventSender,
}

impl LedgerClient for LedgerConnection {
    fn post_transaction(&self, tx: StateTransaction) {
        let state_index = tx.state_index();
        if let Err(e) = self.ledger.confirm(tx) {
            tracing::warn!(state_index, "Anchoring transaction rejected: {}", e);
        }
    }

    fn request_transaction(&self, tx_id: TransactionId) {
        match self.ledger.transaction(&tx_id) {
            Some(tx) => {
                tracing::debug!(tx = %tx_id, state_index = tx.state_index(), "Re-delivering transaction");
                if self.events.send(NodeEvent::StateTransaction(tx)).is_err() {
                    tracing::debug!(tx = %tx_id, "Event queue closed, transaction not re-delivered");
                }
            }
            None => tracing::debug!(tx = %tx_id, "Requested transaction is unknown"),
        }
    }
}
