//! Parallel fan-out of committed blocks to every storage target.

use crate::{apply_block, ApplyOutcome, NodeRegistry, ReplicationError};
use consortium_metrics as metrics;
use consortium_storage::{StoreRegistry, TargetStore};
use consortium_types::{BlockBundle, Hash, NodeId};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: NodeId,
    pub result: Result<ApplyOutcome, ReplicationError>,
}

/// Per-target results of replicating one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub height: u64,
    pub block_hash: Hash,
    /// Ordered by target id.
    pub outcomes: Vec<TargetOutcome>,
}

impl ReplicationReport {
    /// Targets now holding the block.
    pub fn succeeded(&self) -> Vec<&NodeId> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| &o.target)
            .collect()
    }

    pub fn failed(&self) -> Vec<(&NodeId, &ReplicationError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.target, e)))
            .collect()
    }

    /// Failed targets worth retrying later.
    pub fn pending_retry(&self) -> Vec<&NodeId> {
        self.failed()
            .into_iter()
            .filter(|(_, error)| error.is_retryable())
            .map(|(target, _)| target)
            .collect()
    }

    /// Whether every target holds the block.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn outcome(&self, target: &NodeId) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| o.target == *target)
    }
}

/// Writes committed blocks into every registered store.
///
/// Targets are written in parallel, each under its own writer lock. A
/// failure on one target neither blocks nor rolls back the others. The
/// registry's reported height for a target advances only after the block
/// landed there.
pub struct BlockReplicator {
    stores: Arc<StoreRegistry>,
    registry: Arc<NodeRegistry>,
}

impl BlockReplicator {
    pub fn new(stores: Arc<StoreRegistry>, registry: Arc<NodeRegistry>) -> Self {
        Self { stores, registry }
    }

    /// Replicate `bundle` to every registered target.
    pub fn replicate(&self, bundle: &BlockBundle, now_ms: u64) -> ReplicationReport {
        let targets = self.stores.targets();
        self.fan_out(targets, Vec::new(), bundle, now_ms)
    }

    /// Replicate `bundle` to the named targets only, e.g. those left
    /// pending by an earlier report.
    pub fn replicate_to(
        &self,
        targets: &[NodeId],
        bundle: &BlockBundle,
        now_ms: u64,
    ) -> ReplicationReport {
        let mut resolved = Vec::with_capacity(targets.len());
        let mut unresolved = Vec::new();
        for node_id in targets {
            match self.stores.resolve(node_id) {
                Ok(target) => resolved.push(target),
                Err(error) => unresolved.push(TargetOutcome {
                    target: node_id.clone(),
                    result: Err(error.into()),
                }),
            }
        }
        self.fan_out(resolved, unresolved, bundle, now_ms)
    }

    fn fan_out(
        &self,
        targets: Vec<TargetStore>,
        mut outcomes: Vec<TargetOutcome>,
        bundle: &BlockBundle,
        now_ms: u64,
    ) -> ReplicationReport {
        let started = Instant::now();
        let height = bundle.height();

        let applied: Vec<TargetOutcome> = targets
            .par_iter()
            .map(|target| {
                let result = apply_block(target, bundle);
                self.record(target.node_id(), bundle, &result, now_ms);
                TargetOutcome {
                    target: target.node_id().clone(),
                    result,
                }
            })
            .collect();
        outcomes.extend(applied);
        outcomes.sort_by(|a, b| a.target.cmp(&b.target));

        metrics::record_replication_latency(started.elapsed().as_secs_f64());
        let report = ReplicationReport {
            height,
            block_hash: bundle.block.hash,
            outcomes,
        };

        if report.is_complete() {
            info!(height, targets = report.outcomes.len(), "Block replicated");
        } else {
            warn!(
                height,
                succeeded = report.succeeded().len(),
                failed = report.failed().len(),
                pending_retry = report.pending_retry().len(),
                "Block partially replicated"
            );
        }
        report
    }

    fn record(
        &self,
        target: &NodeId,
        bundle: &BlockBundle,
        result: &Result<ApplyOutcome, ReplicationError>,
        now_ms: u64,
    ) {
        match result {
            Ok(outcome) => {
                debug!(target = %target, height = bundle.height(), outcome = outcome.as_str(), "Target holds block");
                self.registry
                    .observe_tip(target, bundle.block.tip(), now_ms);
                metrics::record_replication_outcome(target.as_str(), outcome.as_str());
            }
            Err(error) => {
                warn!(
                    target = %target,
                    height = bundle.height(),
                    %error,
                    retryable = error.is_retryable(),
                    "Replication to target failed"
                );
                metrics::record_replication_outcome(target.as_str(), error.metric_label());
            }
        }
    }
}
