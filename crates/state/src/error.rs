//! State errors

use thiserror::Error;

/// Errors building or applying batches and state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Batch is empty")]
    EmptyBatch,

    #[error("Duplicate request {0} in batch")]
    DuplicateRequest(String),

    #[error("Batch for state #{got} can't be applied to state #{current}")]
    WrongStateIndex { current: u32, got: u32 },

    #[error("State hash mismatch: expected {expected}, computed {computed}")]
    StateHashMismatch { expected: String, computed: String },

    #[error("Request {0} is not ready")]
    RequestNotReady(String),

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,
}

/// Errors from batch stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Batch for state #{0} is already stored with different content")]
    Immutable(u32),
}

/// Errors submitting execution tasks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Too many tasks in flight (limit {0})")]
    Busy(usize),

    #[error("No async runtime available")]
    NoRuntime,
}
