//! Committee membership and peer messaging
//!
//! The transport itself is outside the consensus core. `LocalNetwork` wires a
//! whole committee together in-process over unbounded channels, for the local
//! runner and for tests.

use crate::error::CommitteeError;
use crate::messages::{EventSender, MessageBody, NodeEvent, PeerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Membership view of one committee member
pub trait Committee: Send + Sync {
    fn own_index(&self) -> u16;

    /// Number of peers, N
    fn size(&self) -> u16;

    /// Number of matching signature shares needed, T
    fn quorum(&self) -> u16;

    fn is_alive(&self, index: u16) -> bool;

    /// Send an encoded `PeerMessage` to one peer
    fn send(&self, target: u16, data: Vec<u8>) -> Result<(), CommitteeError>;

    fn send_msg(&self, target: u16, state_index: u32, body: MessageBody) -> Result<(), CommitteeError> {
        let msg = PeerMessage::new(self.own_index(), state_index, body);
        tracing::trace!(target_peer = target, state_index, kind = msg.body.kind(), "Sending");
        self.send(target, msg.to_bytes())
    }

    /// Send to every other peer, returns how many sends succeeded
    fn broadcast_msg(&self, state_index: u32, body: MessageBody) -> usize {
        let data = PeerMessage::new(self.own_index(), state_index, body).to_bytes();
        let own = self.own_index();
        (0..self.size())
            .filter(|&i| i != own)
            .filter(|&i| self.send(i, data.clone()).is_ok())
            .count()
    }
}

/// In-process transport for a whole committee
pub struct LocalNetwork {
    queues: Vec<EventSender>,
    alive: Vec<AtomicBool>,
    quorum: u16,
}

impl LocalNetwork {
    pub fn new(queues: Vec<EventSender>, quorum: u16) -> Arc<Self> {
        let alive = queues.iter().map(|_| AtomicBool::new(true)).collect();
        Arc::new(Self {
            queues,
            alive,
            quorum,
        })
    }

    /// Committee view of one member
    pub fn member(self: &Arc<Self>, own_index: u16) -> LocalCommittee {
        LocalCommittee {
            network: self.clone(),
            own_index,
        }
    }

    /// Mark a peer alive or dead; dead peers neither send nor receive
    pub fn set_alive(&self, index: u16, alive: bool) {
        if let Some(flag) = self.alive.get(index as usize) {
            flag.store(alive, Ordering::SeqCst);
            tracing::info!(peer = index, alive, "Peer liveness changed");
        }
    }

    pub fn is_alive(&self, index: u16) -> bool {
        self.alive
            .get(index as usize)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn size(&self) -> u16 {
        self.queues.len() as u16
    }
}

/// One member's view of a `LocalNetwork`
#[derive(Clone)]
pub struct LocalCommittee {
    network: Arc<LocalNetwork>,
    own_index: u16,
}

impl Committee for LocalCommittee {
    fn own_index(&self) -> u16 {
        self.own_index
    }

    fn size(&self) -> u16 {
        self.network.size()
    }

    fn quorum(&self) -> u16 {
        self.network.quorum
    }

    fn is_alive(&self, index: u16) -> bool {
        // a node always considers itself alive
        index == self.own_index || self.network.is_alive(index)
    }

    fn send(&self, target: u16, data: Vec<u8>) -> Result<(), CommitteeError> {
        let queue = self
            .network
            .queues
            .get(target as usize)
            .ok_or(CommitteeError::UnknownPeer(target))?;
        if !self.network.is_alive(target) {
            return Err(CommitteeError::PeerDead(target));
        }
        if !self.network.is_alive(self.own_index) {
            // a dead node's messages are lost
            return Ok(());
        }
        queue
            .send(NodeEvent::Peer(data))
            .map_err(|_| CommitteeError::Disconnected(target))
    }
}
