//! Committee member event loop
//!
//! One `Node` owns an `Operator` and a `StateManager` and feeds them every
//! event strictly one at a time.

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::messages::{EventReceiver, MessageBody, NodeEvent, PeerMessage};
use crate::operator::Operator;
use crate::statemgr::StateManager;
use sc_state::VirtualState;
use std::sync::Arc;
use tokio::sync::watch;

pub struct Node {
    own_index: u16,
    committee_size: u16,
    operator: Operator,
    state_mgr: StateManager,
    config: ConsensusConfig,
    solid_state_tx: watch::Sender<Option<Arc<VirtualState>>>,
    ticks: u64,
}

impl Node {
    pub fn new(
        own_index: u16,
        committee_size: u16,
        operator: Operator,
        state_mgr: StateManager,
        config: ConsensusConfig,
    ) -> Self {
        let (solid_state_tx, _) = watch::channel(None);
        Self {
            own_index,
            committee_size,
            operator,
            state_mgr,
            config,
            solid_state_tx,
            ticks: 0,
        }
    }

    pub fn own_index(&self) -> u16 {
        self.own_index
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_mgr
    }

    /// Watch the solid state as it advances
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<VirtualState>>> {
        self.solid_state_tx.subscribe()
    }

    /// Process one event. Only invariant violations come back as errors.
    pub fn handle(&mut self, event: NodeEvent) -> Result<(), ConsensusError> {
        match event {
            NodeEvent::Peer(data) => self.handle_peer_message(&data),
            NodeEvent::StateTransaction(tx) => self.state_mgr.event_state_transaction(tx),
            NodeEvent::Request(req) => self.operator.event_request(req),
            NodeEvent::PendingBatch(batch) => self.state_mgr.event_pending_batch(batch),
            NodeEvent::StateTransition { state, state_tx } => {
                self.solid_state_tx.send_replace(Some(state.clone()));
                self.operator.event_state_transition(state, state_tx)
            }
            NodeEvent::ResultCalculated(result) => self.operator.event_result_calculated(*result),
            NodeEvent::TimerTick(tick) => {
                self.state_mgr.event_timer_tick(tick)?;
                self.operator.event_timer_tick()
            }
            NodeEvent::Shutdown => Ok(()),
        }
    }

    /// Advance the local tick counter and process the tick
    pub fn tick(&mut self) -> Result<(), ConsensusError> {
        self.ticks += 1;
        self.handle(NodeEvent::TimerTick(self.ticks))
    }

    fn handle_peer_message(&mut self, data: &[u8]) -> Result<(), ConsensusError> {
        let msg = match PeerMessage::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = self.own_index, "Undecodable peer message: {}", e);
                return Ok(());
            }
        };
        if msg.sender_index >= self.committee_size {
            tracing::warn!(sender = msg.sender_index, "Message from unknown peer index");
            return Ok(());
        }
        tracing::trace!(
            peer = self.own_index,
            sender = msg.sender_index,
            state_index = msg.state_index,
            kind = msg.body.kind(),
            "Peer message"
        );

        let PeerMessage {
            sender_index: sender,
            state_index,
            body,
        } = msg;
        match body {
            MessageBody::GetBatch => self.state_mgr.event_get_batch(sender, state_index),
            MessageBody::BatchHeader { size, state_tx_id } => {
                self.state_mgr
                    .event_batch_header(sender, state_index, size, state_tx_id)
            }
            MessageBody::StateUpdate {
                state_tx_id,
                batch_index,
                state_update,
            } => self.state_mgr.event_state_update(
                sender,
                state_index,
                state_tx_id,
                batch_index,
                state_update,
            ),
            MessageBody::StartProcessingBatch {
                request_ids,
                timestamp,
            } => self
                .operator
                .event_start_processing_batch(sender, state_index, request_ids, timestamp),
            MessageBody::SignedHash {
                batch_hash,
                orig_timestamp,
                essence_hash,
                sig_share,
            } => self.operator.event_signed_hash(
                sender,
                state_index,
                batch_hash,
                orig_timestamp,
                essence_hash,
                sig_share,
            ),
        }
    }

    /// Run until `Shutdown` or the queue closes.
    ///
    /// Returns the error of the first invariant violation, which stops the node.
    pub async fn run(mut self, mut events: EventReceiver) -> Result<(), ConsensusError> {
        let mut timer = tokio::time::interval(self.config.timer_tick_period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(peer = self.own_index, address = %self.config.address, "Node started");

        loop {
            let result = tokio::select! {
                event = events.recv() => match event {
                    Some(NodeEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event),
                },
                _ = timer.tick() => self.tick(),
            };
            if let Err(e) = result {
                tracing::error!(peer = self.own_index, "Node stopped: {}", e);
                return Err(e);
            }
        }

        tracing::info!(
            peer = self.own_index,
            state_index = ?self.state_mgr.solid_state_index(),
            "Node stopped"
        );
        Ok(())
    }
}
