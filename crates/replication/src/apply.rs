//! The idempotent block apply path.

use crate::ReplicationError;
use consortium_metrics as metrics;
use consortium_storage::{BlockId, LedgerStore, StorageError, TargetStore};
use consortium_types::{Block, BlockBundle};
use std::time::Instant;

/// Result of applying one block to one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The block, its transactions and links were written.
    Applied { block_id: BlockId },
    /// The store already held this block. Nothing was written.
    AlreadyPresent,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied { .. } => "applied",
            ApplyOutcome::AlreadyPresent => "already_present",
        }
    }
}

/// Apply `bundle` to `target` under its writer lock.
///
/// A block already present at its height is skipped entirely, its
/// transactions and links assumed applied with it. Otherwise the block must
/// extend the target's tip, and block, transactions and links are written
/// in one atomic transaction.
pub fn apply_block(
    target: &TargetStore,
    bundle: &BlockBundle,
) -> Result<ApplyOutcome, ReplicationError> {
    let _writer = target.lock_writer();
    apply_locked(target.store(), bundle)
}

/// [`apply_block`] for callers already holding the target's writer lock.
pub(crate) fn apply_locked(
    store: &dyn LedgerStore,
    bundle: &BlockBundle,
) -> Result<ApplyOutcome, ReplicationError> {
    let started = Instant::now();
    let block = &bundle.block;

    if let Some(existing) = store.get_block_at_height(block.height)? {
        if existing.block.hash == block.hash {
            return Ok(ApplyOutcome::AlreadyPresent);
        }
        return Err(StorageError::Conflict {
            height: block.height,
            existing: existing.block.hash,
            incoming: block.hash,
        }
        .into());
    }
    check_extends_tip(store, block)?;

    let mut block_id = None;
    store.write_atomically(&mut |writer| {
        let id = writer.insert_block_if_absent(block)?;
        for tx in &bundle.transactions {
            writer.insert_transaction_if_absent(tx)?;
        }
        for tx in &bundle.transactions {
            writer.insert_block_transaction_link(id, &tx.id)?;
        }
        block_id = Some(id);
        Ok(())
    })?;
    metrics::record_storage_operation("apply_block", started.elapsed().as_secs_f64());

    block_id
        .map(|block_id| ApplyOutcome::Applied { block_id })
        .ok_or_else(|| StorageError::Backend("atomic write returned no block id".into()).into())
}

fn check_extends_tip(store: &dyn LedgerStore, block: &Block) -> Result<(), ReplicationError> {
    match store.tip()? {
        None if block.is_genesis() => Ok(()),
        Some(tip) if tip.height + 1 == block.height => {
            if tip.hash == block.previous_hash {
                Ok(())
            } else {
                Err(ReplicationError::PreviousHashMismatch {
                    height: block.height,
                    expected: tip.hash,
                    got: block.previous_hash,
                })
            }
        }
        tip => Err(ReplicationError::NonContiguous {
            tip: tip.map(|t| t.height),
            height: block.height,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_storage::test_helpers::{keypair, make_chain};
    use consortium_storage_memory::MemoryLedgerStore;
    use consortium_types::NodeId;
    use std::sync::Arc;

    fn target() -> (Arc<MemoryLedgerStore>, TargetStore) {
        let store = Arc::new(MemoryLedgerStore::new());
        let target = TargetStore::new(NodeId::from("m1"), store.clone());
        (store, target)
    }

    #[test]
    fn test_apply_then_replay_is_noop() {
        let (store, target) = target();
        let chain = make_chain(&keypair("authority", 1), 2, 3);
        apply_block(&target, &chain[0]).unwrap();
        let first = apply_block(&target, &chain[1]).unwrap();
        assert!(matches!(first, ApplyOutcome::Applied { .. }));

        let before = store.get_bundle_at_height(1).unwrap();
        let links = store.link_count();
        assert_eq!(apply_block(&target, &chain[1]).unwrap(), ApplyOutcome::AlreadyPresent);
        assert_eq!(store.get_bundle_at_height(1).unwrap(), before);
        assert_eq!(store.link_count(), links);
    }

    #[test]
    fn test_gap_rejected() {
        let (store, target) = target();
        let chain = make_chain(&keypair("authority", 1), 3, 1);
        assert_eq!(
            apply_block(&target, &chain[1]),
            Err(ReplicationError::NonContiguous { tip: None, height: 1 })
        );
        apply_block(&target, &chain[0]).unwrap();
        assert_eq!(
            apply_block(&target, &chain[2]),
            Err(ReplicationError::NonContiguous {
                tip: Some(0),
                height: 2
            })
        );
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn test_fork_rejected() {
        let (_, target) = target();
        let ours = make_chain(&keypair("authority", 1), 2, 1);
        let theirs = make_chain(&keypair("rival", 2), 3, 1);
        apply_block(&target, &ours[0]).unwrap();
        apply_block(&target, &ours[1]).unwrap();

        let conflict = apply_block(&target, &theirs[1]).unwrap_err();
        assert_eq!(conflict.metric_label(), "conflict");
        assert!(!conflict.is_retryable());

        let fork = apply_block(&target, &theirs[2]).unwrap_err();
        assert!(matches!(
            fork,
            ReplicationError::PreviousHashMismatch { height: 2, .. }
        ));
    }

    #[test]
    fn test_outage_is_retryable() {
        let (store, target) = target();
        let chain = make_chain(&keypair("authority", 1), 1, 0);
        store.set_available(false);
        let error = apply_block(&target, &chain[0]).unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(error.metric_label(), "unavailable");
    }

    #[test]
    fn test_concurrent_apply_writes_once() {
        let (store, target) = target();
        let chain = make_chain(&keypair("authority", 1), 2, 4);
        apply_block(&target, &chain[0]).unwrap();

        let outcomes: Vec<ApplyOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| apply_block(&target, &chain[1]).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, ApplyOutcome::Applied { .. }))
            .count();
        assert_eq!(applied, 1);
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.link_count(), 4);
    }
}
