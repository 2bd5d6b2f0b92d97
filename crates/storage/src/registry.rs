//! Resolution of node ids to store handles.

use crate::{LedgerStore, StorageError};
use consortium_types::NodeId;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A node's store plus the single-writer lock that serializes block
/// application against it.
///
/// Cloning shares both the store and the lock.
#[derive(Clone)]
pub struct TargetStore {
    node_id: NodeId,
    store: Arc<dyn LedgerStore>,
    writer: Arc<Mutex<()>>,
}

impl TargetStore {
    /// Wrap a store for `node_id` with a fresh writer lock.
    pub fn new(node_id: NodeId, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            node_id,
            store,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Node owning this store.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    /// Shared handle to the underlying store.
    pub fn store_arc(&self) -> Arc<dyn LedgerStore> {
        self.store.clone()
    }

    /// Acquire the target's writer lock.
    ///
    /// Every path that applies blocks to this store must hold it for the
    /// whole check-then-write sequence.
    pub fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }
}

impl std::fmt::Debug for TargetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetStore")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Factory resolving node ids to their store handles.
#[derive(Default)]
pub struct StoreRegistry {
    targets: RwLock<BTreeMap<NodeId, TargetStore>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the store for `node_id`.
    ///
    /// Re-registering a node keeps its existing handle so writer locks stay
    /// shared with callers that already resolved it.
    pub fn register(&self, node_id: NodeId, store: Arc<dyn LedgerStore>) -> TargetStore {
        self.targets
            .write()
            .entry(node_id.clone())
            .or_insert_with(|| TargetStore::new(node_id, store))
            .clone()
    }

    /// Resolve a node id to its store handle.
    pub fn resolve(&self, node_id: &NodeId) -> Result<TargetStore, StorageError> {
        self.targets
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownTarget(node_id.clone()))
    }

    /// Every registered target, ordered by node id.
    pub fn targets(&self) -> Vec<TargetStore> {
        self.targets.read().values().cloned().collect()
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    /// Whether no target is registered.
    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}
