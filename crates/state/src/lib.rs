//! SC State - state model and deterministic execution for a smart contract committee
//!
//! This crate provides everything the consensus core treats as a collaborator:
//! - Content hashing, addresses and requests
//! - State updates, batches and the virtual state they are applied to
//! - Anchoring (state) transactions posted to the ledger
//! - The execution task and its built-in processor
//! - Batch stores (in-memory and sled-backed)

pub mod batch;
pub mod error;
pub mod hashing;
pub mod processor;
pub mod runner;
pub mod state;
pub mod store;
pub mod transaction;
pub mod types;

pub use batch::{batch_hash, Batch, Mutation, StateUpdate};
pub use error::{RunnerError, StateError, StoreError};
pub use hashing::{hash_data, HashValue};
pub use processor::{entropy_from, run_task, VmResult, VmTask};
pub use runner::{BlockingRunner, InlineRunner, TaskCallback, TaskRunner};
pub use state::VirtualState;
pub use store::{BatchStore, MemoryBatchStore, PersistentStore};
pub use transaction::{Output, StateBlock, StateTransaction, TransactionId, TxEssence};
pub use types::{Address, Request, RequestCode, RequestId};

/// State index of the origin state
pub const ORIGIN_STATE_INDEX: u32 = 0;
