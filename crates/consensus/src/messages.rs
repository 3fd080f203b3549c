//! Peer messages and node events

use borsh::{BorshDeserialize, BorshSerialize};
use sc_state::{
    Batch, HashValue, Request, RequestId, StateTransaction, StateUpdate, TransactionId, VirtualState,
    VmResult,
};
use std::sync::Arc;

/// Message exchanged between committee peers
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PeerMessage {
    pub sender_index: u16,
    /// State index the message pertains to
    pub state_index: u32,
    pub body: MessageBody,
}

/// Message payloads
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MessageBody {
    /// Ask a peer for the batch producing `state_index`
    GetBatch,

    /// Announces a batch; followed by `size` state update messages
    BatchHeader {
        size: u16,
        state_tx_id: TransactionId,
    },

    /// One state update of an announced batch
    StateUpdate {
        state_tx_id: TransactionId,
        batch_index: u16,
        state_update: StateUpdate,
    },

    /// Leader asks followers to compute a batch
    StartProcessingBatch {
        request_ids: Vec<RequestId>,
        timestamp: i64,
    },

    /// Follower's signature share over the result transaction essence
    SignedHash {
        batch_hash: HashValue,
        orig_timestamp: i64,
        essence_hash: HashValue,
        sig_share: Vec<u8>,
    },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::GetBatch => "get_batch",
            MessageBody::BatchHeader { .. } => "batch_header",
            MessageBody::StateUpdate { .. } => "state_update",
            MessageBody::StartProcessingBatch { .. } => "start_processing_batch",
            MessageBody::SignedHash { .. } => "signed_hash",
        }
    }
}

impl PeerMessage {
    pub fn new(sender_index: u16, state_index: u32, body: MessageBody) -> Self {
        Self {
            sender_index,
            state_index,
            body,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("PeerMessage serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Everything a committee member reacts to, in one serialized stream
#[derive(Debug)]
pub enum NodeEvent {
    /// Encoded `PeerMessage` delivered by the committee transport
    Peer(Vec<u8>),
    /// Anchoring transaction confirmed on the ledger
    StateTransaction(StateTransaction),
    /// New request to the contract seen on the ledger
    Request(Request),
    /// Fully reconstructed batch waiting to be applied
    PendingBatch(Batch),
    /// Solid state advanced
    StateTransition {
        state: Arc<VirtualState>,
        state_tx: StateTransaction,
    },
    /// Execution task finished
    ResultCalculated(Box<VmResult>),
    TimerTick(u64),
    Shutdown,
}

/// Handle for posting events into a node's stream
pub type EventSender = tokio::sync::mpsc::UnboundedSender<NodeEvent>;

/// Receiving end of a node's stream
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<NodeEvent>;

/// Create a node event stream
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
