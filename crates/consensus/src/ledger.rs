//! Ledger collaborator

use sc_state::{StateTransaction, TransactionId};

/// Outbound side of the ledger feed.
///
/// Both calls are fire-and-forget: confirmations and re-delivered
/// transactions come back later as `NodeEvent::StateTransaction`.
pub trait LedgerClient: Send + Sync {
    /// Post a fully signed anchoring transaction
    fn post_transaction(&self, tx: StateTransaction);

    /// Ask the feed to deliver a confirmed transaction again
    fn request_transaction(&self, tx_id: TransactionId);
}
