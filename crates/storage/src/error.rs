//! Storage error type.

use consortium_types::{Hash, NodeId};

/// Errors returned by ledger stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The store cannot be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// No store is registered for this node.
    #[error("no store registered for node {0}")]
    UnknownTarget(NodeId),

    /// A different block already occupies this height.
    #[error("height {height} already holds block {existing}, refusing {incoming}")]
    Conflict {
        /// Contested height.
        height: u64,
        /// Hash already stored.
        existing: Hash,
        /// Hash that was offered.
        incoming: Hash,
    },

    /// A link references a block or transaction the store does not hold.
    #[error("link references missing row: block {block_id}, transaction {tx_id}")]
    DanglingLink {
        /// Store-local block id.
        block_id: u64,
        /// Global transaction id.
        tx_id: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Backend(_))
    }
}
