//! SC Consensus - committee consensus core for a replicated smart contract
//!
//! Architecture:
//! - A fixed committee of N peers, quorum T, jointly runs one smart contract
//! - Leaders are rotated over a permutation reseeded from every anchoring transaction
//! - Every member computes each batch; the leader collects T matching signature
//!   shares and posts the fully signed anchoring transaction to the ledger
//! - Members which fall behind fetch missing batches from their peers
//!
//! All mutation happens on a single serialized event stream per member (see
//! [`Node`]); execution tasks run elsewhere and re-enter the stream as events.

pub mod committee;
pub mod config;
pub mod error;
pub mod ledger;
pub mod messages;
pub mod node;
pub mod operator;
pub mod permutation;
pub mod signer;
pub mod statemgr;

#[cfg(test)]
mod tests;

pub use committee::{Committee, LocalCommittee, LocalNetwork};
pub use config::ConsensusConfig;
pub use error::{CommitteeError, ConsensusError, SignerError};
pub use ledger::LedgerClient;
pub use messages::{EventSender, MessageBody, NodeEvent, PeerMessage};
pub use node::Node;
pub use operator::Operator;
pub use permutation::PeerPermutation;
pub use signer::{MultisigSigner, ThresholdSigner};
pub use statemgr::StateManager;
