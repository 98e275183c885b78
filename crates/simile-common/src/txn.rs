//! Transaction identifiers.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Identifier for a transaction.
///
/// Transactions are created implicitly: the buffer pool starts tracking an
/// id the first time a page is requested under it, and forgets it again at
/// commit or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Mints a fresh, process-unique transaction id.
    pub fn new() -> Self {
        Self(NEXT_TID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}
