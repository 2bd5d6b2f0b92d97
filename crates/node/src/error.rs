//! Node runtime errors.

use consortium_consensus::ProposeError;
use consortium_replication::{SyncError, ValidationError};
use consortium_storage::StorageError;
use consortium_types::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Failure of one RPC to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{peer} did not answer within {timeout:?}")]
    Timeout { peer: NodeId, timeout: Duration },

    #[error("{0} is unreachable")]
    PeerUnreachable(NodeId),

    #[error("{0} is not a known peer")]
    UnknownPeer(NodeId),

    #[error("transport shut down")]
    Shutdown,

    /// The peer answered, but could not serve the request.
    #[error("{peer} failed to serve request: {reason}")]
    Remote { peer: NodeId, reason: String },
}

impl TransportError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TransportError::Timeout { .. } => "timeout",
            TransportError::PeerUnreachable(_) => "unreachable",
            TransportError::UnknownPeer(_) => "unknown_peer",
            TransportError::Shutdown => "shutdown",
            TransportError::Remote { .. } => "remote",
        }
    }
}

/// Errors surfaced by [`LedgerNode`](crate::LedgerNode).
///
/// Only [`NodeError::Config`] is terminal. Everything else is a routine
/// outcome the caller may retry.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Propose(#[from] ProposeError),

    #[error("block rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("no replication to retry at height {0}")]
    NothingToRetry(u64),
}

impl NodeError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeError::Config(_))
    }
}
