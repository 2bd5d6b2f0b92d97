//! Catch-up of a lagging store from a peer.

use crate::apply::apply_locked;
use crate::{validate_block, ApplyOutcome, FetchError, NodeRegistry, ReplicationError, SyncError};
use async_trait::async_trait;
use consortium_metrics as metrics;
use consortium_storage::{LedgerStore, StorageError, TargetStore};
use consortium_types::{BlockBundle, ChainTip, NodeId, NodeStatus, SignatureVerifier};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where catch-up pulls blocks from.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// The peer being read.
    fn peer_id(&self) -> &NodeId;

    /// The peer's chain tip.
    async fn tip(&self) -> Result<Option<ChainTip>, FetchError>;

    /// The block at `height` with its ordered transactions.
    async fn fetch_block(&self, height: u64) -> Result<Option<BlockBundle>, FetchError>;
}

/// A [`BlockSource`] reading a peer's store directly.
pub struct StoreBlockSource {
    peer_id: NodeId,
    store: Arc<dyn LedgerStore>,
}

impl StoreBlockSource {
    pub fn new(peer_id: NodeId, store: Arc<dyn LedgerStore>) -> Self {
        Self { peer_id, store }
    }

    fn unreachable(&self, error: StorageError) -> FetchError {
        FetchError::Unreachable {
            peer: self.peer_id.clone(),
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl BlockSource for StoreBlockSource {
    fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    async fn tip(&self) -> Result<Option<ChainTip>, FetchError> {
        self.store.tip().map_err(|e| self.unreachable(e))
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<BlockBundle>, FetchError> {
        self.store
            .get_bundle_at_height(height)
            .map_err(|e| self.unreachable(e))
    }
}

/// Result of a completed catch-up run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub peer: NodeId,
    /// Local height before the run.
    pub start_height: Option<u64>,
    /// Height the peer reported.
    pub peer_height: Option<u64>,
    /// Heights written by this run.
    pub applied: Vec<u64>,
    /// Heights that arrived through live replication meanwhile.
    pub skipped: Vec<u64>,
}

impl SyncReport {
    /// Local height after the run.
    pub fn final_height(&self) -> Option<u64> {
        self.applied
            .iter()
            .chain(self.skipped.iter())
            .max()
            .copied()
            .or(self.start_height)
    }

    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.skipped.is_empty()
    }
}

/// Pulls, validates and applies missing heights from a peer.
///
/// Heights are applied strictly in ascending order. The first block that
/// fails validation ends the run; nothing above it is applied, and the
/// node stays at the last height it validated. The writer lock of the
/// local target is held only around each check-validate-write step, never
/// across a fetch.
pub struct SyncProtocol {
    verifier: Arc<dyn SignatureVerifier>,
    registry: Arc<NodeRegistry>,
}

impl SyncProtocol {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, registry: Arc<NodeRegistry>) -> Self {
        Self { verifier, registry }
    }

    /// Catch `local` up to `source`'s tip.
    pub async fn catch_up(
        &self,
        local: &TargetStore,
        source: &dyn BlockSource,
        now_ms: u64,
    ) -> Result<SyncReport, SyncError> {
        let local_id = local.node_id().clone();
        let peer = source.peer_id().clone();

        let start_tip = local.store().tip().map_err(|error| SyncError::Storage {
            error,
            applied_through: None,
        })?;
        let start_height = start_tip.map(|t| t.height);

        let peer_tip = match source.tip().await {
            Ok(tip) => tip,
            Err(error) => {
                self.registry.set_status(&peer, NodeStatus::Unreachable);
                return Err(self.fail(SyncError::PeerUnreachable {
                    error,
                    applied_through: start_height,
                }));
            }
        };
        if let Some(tip) = peer_tip {
            self.registry.observe_tip(&peer, tip, now_ms);
        }

        let mut report = SyncReport {
            peer: peer.clone(),
            start_height,
            peer_height: peer_tip.map(|t| t.height),
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        let Some(peer_tip) = peer_tip.filter(|tip| Some(tip.height) > start_height) else {
            debug!(node = %local_id, peer = %peer, "Peer not ahead, nothing to sync");
            return Ok(report);
        };

        info!(
            node = %local_id,
            peer = %peer,
            local_height = ?start_height,
            peer_height = peer_tip.height,
            "Catching up from peer"
        );
        self.registry.set_status(&local_id, NodeStatus::Syncing);

        let first = start_height.map_or(0, |h| h + 1);
        let mut applied_through = start_height;
        for height in first..=peer_tip.height {
            let bundle = match source.fetch_block(height).await {
                Ok(Some(bundle)) => bundle,
                Ok(None) => {
                    return Err(self.abort(
                        &local_id,
                        SyncError::PeerUnreachable {
                            error: FetchError::Missing {
                                peer: peer.clone(),
                                height,
                            },
                            applied_through,
                        },
                    ));
                }
                Err(error) => {
                    return Err(self.abort(
                        &local_id,
                        SyncError::PeerUnreachable {
                            error,
                            applied_through,
                        },
                    ));
                }
            };

            match self.apply_validated(local, &bundle, height, applied_through) {
                Ok(ApplyOutcome::Applied { .. }) => report.applied.push(height),
                Ok(ApplyOutcome::AlreadyPresent) => report.skipped.push(height),
                Err(error) => return Err(self.abort(&local_id, error)),
            }
            applied_through = Some(height);
            self.registry
                .observe_tip(&local_id, bundle.block.tip(), now_ms);
            metrics::set_block_height(height);
        }

        self.registry.set_status(&local_id, NodeStatus::Active);
        metrics::record_sync_applied(report.applied.len() as u64);
        info!(
            node = %local_id,
            peer = %peer,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            height = ?report.final_height(),
            "Catch-up complete"
        );
        Ok(report)
    }

    /// Check, validate and write one height under the writer lock.
    fn apply_validated(
        &self,
        local: &TargetStore,
        bundle: &BlockBundle,
        height: u64,
        applied_through: Option<u64>,
    ) -> Result<ApplyOutcome, SyncError> {
        let storage = |error: StorageError| SyncError::Storage {
            error,
            applied_through,
        };
        let _writer = local.lock_writer();
        let store = local.store();

        if let Some(existing) = store.get_block_at_height(height).map_err(storage)? {
            if existing.block.hash == bundle.block.hash {
                return Ok(ApplyOutcome::AlreadyPresent);
            }
        }

        let parent = if height == 0 {
            None
        } else {
            match store.get_block_at_height(height - 1).map_err(storage)? {
                Some(stored) => Some(stored.block.tip()),
                None => {
                    return Err(SyncError::NonContiguous {
                        height,
                        applied_through,
                    })
                }
            }
        };

        if let Err(error) = validate_block(bundle, parent.as_ref(), self.verifier.as_ref()) {
            metrics::record_validation_failure(error.metric_label());
            return Err(SyncError::Validation {
                height,
                error,
                applied_through,
            });
        }

        apply_locked(store, bundle).map_err(|error| match error {
            ReplicationError::Storage(error) => storage(error),
            ReplicationError::NonContiguous { .. } | ReplicationError::PreviousHashMismatch { .. } => {
                SyncError::NonContiguous {
                    height,
                    applied_through,
                }
            }
        })
    }

    fn abort(&self, local_id: &NodeId, error: SyncError) -> SyncError {
        self.registry.set_status(local_id, NodeStatus::Active);
        self.fail(error)
    }

    fn fail(&self, error: SyncError) -> SyncError {
        warn!(
            %error,
            applied_through = ?error.applied_through(),
            "Catch-up aborted"
        );
        metrics::record_sync_failure(error.metric_label());
        error
    }
}
