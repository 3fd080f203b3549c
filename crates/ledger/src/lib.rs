//! SC Ledger - the external ledger a committee anchors its state to
//!
//! The ledger keeps the confirmed chain of anchoring transactions of one
//! contract and the requests posted to it. Each committee member connects
//! with its event queue and receives confirmed transactions and requests as
//! `NodeEvent`s.

pub mod error;
pub mod ledger;

pub use error::LedgerError;
pub use ledger::{InMemoryLedger, LedgerConnection};
