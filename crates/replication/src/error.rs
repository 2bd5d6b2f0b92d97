//! Replication, validation and sync errors.

use consortium_storage::StorageError;
use consortium_types::{Hash, NodeId};

/// A block failed verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("expected height {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("block {height}: hash {claimed} does not match recomputed {computed}")]
    HashMismatch {
        height: u64,
        claimed: Hash,
        computed: Hash,
    },

    #[error("block {height}: previous hash {got} does not link to local tip {expected}")]
    PreviousHashMismatch {
        height: u64,
        expected: Hash,
        got: Hash,
    },

    #[error("block {height}: signature by {signer} does not verify")]
    BadSignature { height: u64, signer: NodeId },

    #[error("block {height}: transaction {tx_id} hash does not match its contents")]
    TransactionHashMismatch { height: u64, tx_id: String },

    #[error("block {height}: declares {declared} transactions, carries {actual}")]
    TxCountMismatch {
        height: u64,
        declared: u32,
        actual: usize,
    },

    #[error("block {height}: merkle root {claimed} does not match transactions ({computed})")]
    MerkleMismatch {
        height: u64,
        claimed: Hash,
        computed: Hash,
    },
}

impl ValidationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ValidationError::HeightMismatch { .. } => "height_mismatch",
            ValidationError::HashMismatch { .. } => "hash_mismatch",
            ValidationError::PreviousHashMismatch { .. } => "previous_hash_mismatch",
            ValidationError::BadSignature { .. } => "bad_signature",
            ValidationError::TransactionHashMismatch { .. } => "transaction_hash_mismatch",
            ValidationError::TxCountMismatch { .. } => "tx_count_mismatch",
            ValidationError::MerkleMismatch { .. } => "merkle_mismatch",
        }
    }
}

/// Writing a block into one target failed.
///
/// Scoped to that target; other targets are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The target is missing earlier heights.
    #[error("target tip is at {tip:?}, cannot apply height {height}")]
    NonContiguous { tip: Option<u64>, height: u64 },

    /// The target's tip is a different chain.
    #[error("height {height} links to {got}, target tip is {expected}")]
    PreviousHashMismatch {
        height: u64,
        expected: Hash,
        got: Hash,
    },
}

impl ReplicationError {
    /// Whether re-driving replication to this target later may succeed.
    ///
    /// A non-contiguous target becomes writable once it has caught up.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Storage(e) => e.is_transient(),
            ReplicationError::NonContiguous { .. } => true,
            ReplicationError::PreviousHashMismatch { .. } => false,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            ReplicationError::Storage(StorageError::Unavailable(_)) => "unavailable",
            ReplicationError::Storage(StorageError::Conflict { .. }) => "conflict",
            ReplicationError::Storage(_) => "storage",
            ReplicationError::NonContiguous { .. } => "non_contiguous",
            ReplicationError::PreviousHashMismatch { .. } => "previous_hash_mismatch",
        }
    }
}

/// A peer could not serve a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: NodeId, reason: String },

    #[error("peer {peer} has no block at height {height}")]
    Missing { peer: NodeId, height: u64 },
}

/// A catch-up run stopped early.
///
/// `applied_through` is the local height the node remains at (`None` for
/// an empty store).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("validation failed at height {height}: {error}")]
    Validation {
        height: u64,
        #[source]
        error: ValidationError,
        applied_through: Option<u64>,
    },

    #[error("peer unreachable during catch-up: {error}")]
    PeerUnreachable {
        #[source]
        error: FetchError,
        applied_through: Option<u64>,
    },

    #[error("cannot apply height {height}: local chain has a gap")]
    NonContiguous {
        height: u64,
        applied_through: Option<u64>,
    },

    #[error("local store failed during catch-up: {error}")]
    Storage {
        #[source]
        error: StorageError,
        applied_through: Option<u64>,
    },
}

impl SyncError {
    pub fn applied_through(&self) -> Option<u64> {
        match self {
            SyncError::Validation {
                applied_through, ..
            }
            | SyncError::PeerUnreachable {
                applied_through, ..
            }
            | SyncError::NonContiguous {
                applied_through, ..
            }
            | SyncError::Storage {
                applied_through, ..
            } => *applied_through,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            SyncError::Validation { .. } => "validation",
            SyncError::PeerUnreachable { .. } => "peer_unreachable",
            SyncError::NonContiguous { .. } => "non_contiguous",
            SyncError::Storage { .. } => "storage",
        }
    }
}
