//! Ledger errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transaction is for another contract")]
    WrongAddress,

    #[error("Origin already confirmed")]
    OriginExists,

    #[error("Origin transaction must have state index 0, got #{0}")]
    NotOrigin(u32),

    #[error("Expected state #{expected}, got #{got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("Transaction is not signed")]
    Unsigned,

    #[error("Invalid signature: {0}")]
    BadSignature(String),

    #[error("Request {0} was already posted")]
    DuplicateRequest(String),
}
