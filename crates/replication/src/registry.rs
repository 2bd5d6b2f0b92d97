//! Directory of known nodes.

use consortium_storage::{LedgerStore, NodeFilter};
use consortium_types::{ChainTip, NodeId, NodeRecord, NodeStatus, Role};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node counts by role and status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatistics {
    pub total: usize,
    pub authorities: usize,
    pub members: usize,
    pub active: usize,
    pub syncing: usize,
    pub unreachable: usize,
    /// Highest height any node has reported.
    pub max_reported_height: Option<u64>,
}

/// Known nodes with role, reachability and last reported tip.
///
/// Roles are fixed when a node is registered. Entries are never removed.
/// When a directory store is attached every change is written through to
/// it; write-through failures are logged and do not fail the caller.
pub struct NodeRegistry {
    nodes: DashMap<NodeId, NodeRecord>,
    directory: Option<Arc<dyn LedgerStore>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            directory: None,
        }
    }

    /// Write every change through to `store`'s node directory.
    pub fn with_directory(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.directory = Some(store);
        self
    }

    /// Load entries already present in the attached directory.
    pub fn load_directory(&self) -> usize {
        let Some(store) = &self.directory else {
            return 0;
        };
        match store.list_nodes(&NodeFilter::all()) {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    self.nodes.entry(record.id.clone()).or_insert(record);
                }
                count
            }
            Err(error) => {
                warn!(%error, "Failed to load node directory");
                0
            }
        }
    }

    /// Register a node with its role.
    ///
    /// Registering a known node again keeps its original role.
    pub fn register(&self, node_id: NodeId, role: Role, now_ms: u64) -> NodeRecord {
        let entry = self.nodes.entry(node_id.clone()).or_insert_with(|| {
            info!(node = %node_id, role = role.as_str(), "Node registered");
            NodeRecord::new(node_id.clone(), role, now_ms)
        });
        self.persist(&entry);
        let record = entry.clone();
        drop(entry);
        if record.role != role {
            warn!(
                node = %node_id,
                registered = record.role.as_str(),
                requested = role.as_str(),
                "Ignoring role change for registered node"
            );
        }
        record
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|r| r.clone())
    }

    pub fn role_of(&self, node_id: &NodeId) -> Option<Role> {
        self.nodes.get(node_id).map(|r| r.role)
    }

    /// The registered Authority, if any.
    pub fn authority(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|r| r.role == Role::Authority)
            .map(|r| r.id.clone())
    }

    /// Record that `node_id` holds `tip`. Contact implies reachability, so
    /// an unreachable node becomes active; a syncing node stays syncing.
    ///
    /// Stores never lose blocks, so a tip below the reported height only
    /// refreshes contact time.
    pub fn observe_tip(&self, node_id: &NodeId, tip: ChainTip, now_ms: u64) {
        self.update(node_id, |record| {
            if record.reported_height.map_or(true, |h| tip.height >= h) {
                record.reported_height = Some(tip.height);
                record.last_block_hash = Some(tip.hash);
            }
            record.last_seen_ms = record.last_seen_ms.max(now_ms);
            if record.status == NodeStatus::Unreachable {
                record.status = NodeStatus::Active;
            }
        });
    }

    /// Record contact without a tip.
    pub fn observe_contact(&self, node_id: &NodeId, now_ms: u64) {
        self.update(node_id, |record| {
            record.last_seen_ms = record.last_seen_ms.max(now_ms);
            if record.status == NodeStatus::Unreachable {
                record.status = NodeStatus::Active;
            }
        });
    }

    pub fn set_status(&self, node_id: &NodeId, status: NodeStatus) {
        self.update(node_id, |record| {
            if record.status != status {
                debug!(
                    node = %record.id,
                    from = record.status.as_str(),
                    to = status.as_str(),
                    "Node status changed"
                );
                record.status = status;
            }
        });
    }

    /// Mark nodes silent for longer than `threshold_ms` as unreachable and
    /// return them. `exclude` (normally the local node) is never marked.
    pub fn mark_stale(&self, now_ms: u64, threshold_ms: u64, exclude: &NodeId) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|r| {
                r.id != *exclude
                    && r.status != NodeStatus::Unreachable
                    && now_ms.saturating_sub(r.last_seen_ms) > threshold_ms
            })
            .map(|r| r.id.clone())
            .collect();
        for node_id in &stale {
            warn!(node = %node_id, threshold_ms, "Node unreachable");
            self.set_status(node_id, NodeStatus::Unreachable);
        }
        stale
    }

    /// Entries matching `filter`, ordered by node id.
    pub fn list(&self, filter: &NodeFilter) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Reachable nodes other than `local` reporting a height above
    /// `local_height`, highest first.
    pub fn peers_ahead_of(&self, local: &NodeId, local_height: Option<u64>) -> Vec<NodeRecord> {
        let mut ahead: Vec<NodeRecord> = self
            .nodes
            .iter()
            .filter(|r| {
                r.id != *local
                    && r.status != NodeStatus::Unreachable
                    && r.reported_height.is_some()
                    && r.reported_height > local_height
            })
            .map(|r| r.clone())
            .collect();
        ahead.sort_by(|a, b| b.reported_height.cmp(&a.reported_height).then(a.id.cmp(&b.id)));
        ahead
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics::default();
        for record in self.nodes.iter() {
            stats.total += 1;
            match record.role {
                Role::Authority => stats.authorities += 1,
                Role::Member => stats.members += 1,
            }
            match record.status {
                NodeStatus::Active => stats.active += 1,
                NodeStatus::Syncing => stats.syncing += 1,
                NodeStatus::Unreachable => stats.unreachable += 1,
            }
            stats.max_reported_height = stats.max_reported_height.max(record.reported_height);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply `f` and write the result through before releasing the entry,
    /// so directory writes for one node land in the order they were made.
    fn update(&self, node_id: &NodeId, f: impl FnOnce(&mut NodeRecord)) {
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            debug!(node = %node_id, "Ignoring update for unregistered node");
            return;
        };
        f(&mut entry);
        self.persist(&entry);
    }

    fn persist(&self, record: &NodeRecord) {
        if let Some(store) = &self.directory {
            if let Err(error) = store.upsert_node(record) {
                warn!(node = %record.id, %error, "Failed to persist node record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_storage_memory::MemoryLedgerStore;
    use consortium_types::Hash;

    fn tip(height: u64) -> ChainTip {
        ChainTip {
            height,
            hash: Hash::from_bytes(&height.to_be_bytes()),
        }
    }

    #[test]
    fn test_role_fixed_at_registration() {
        let registry = NodeRegistry::new();
        let id = NodeId::from("authority-backup");
        registry.register(id.clone(), Role::Member, 0);
        registry.register(id.clone(), Role::Authority, 5);
        assert_eq!(registry.role_of(&id), Some(Role::Member));
        assert_eq!(registry.authority(), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_observe_and_stale() {
        let registry = NodeRegistry::new();
        let local = NodeId::from("m1");
        let peer = NodeId::from("m2");
        registry.register(local.clone(), Role::Member, 0);
        registry.register(peer.clone(), Role::Member, 0);

        registry.observe_tip(&peer, tip(12), 1_000);
        assert_eq!(registry.get(&peer).unwrap().reported_height, Some(12));

        let stale = registry.mark_stale(10_000, 5_000, &local);
        assert_eq!(stale, vec![peer.clone()]);
        assert_eq!(registry.get(&peer).unwrap().status, NodeStatus::Unreachable);
        assert_eq!(registry.get(&local).unwrap().status, NodeStatus::Active);
        assert!(registry.peers_ahead_of(&local, Some(10)).is_empty());

        registry.observe_tip(&peer, tip(13), 10_500);
        assert_eq!(registry.get(&peer).unwrap().status, NodeStatus::Active);
        let ahead = registry.peers_ahead_of(&local, Some(10));
        assert_eq!(ahead.len(), 1);
        assert_eq!(ahead[0].reported_height, Some(13));
    }

    #[test]
    fn test_statistics() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("authority"), Role::Authority, 0);
        for id in ["m1", "m2", "m3"] {
            registry.register(NodeId::from(id), Role::Member, 0);
        }
        registry.set_status(&NodeId::from("m1"), NodeStatus::Syncing);
        registry.set_status(&NodeId::from("m2"), NodeStatus::Unreachable);
        registry.observe_tip(&NodeId::from("m3"), tip(7), 1);

        let stats = registry.statistics();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.authorities, 1);
        assert_eq!(stats.members, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.syncing, 1);
        assert_eq!(stats.unreachable, 1);
        assert_eq!(stats.max_reported_height, Some(7));
    }

    #[test]
    fn test_directory_write_through() {
        let store = Arc::new(MemoryLedgerStore::new());
        let registry = NodeRegistry::new().with_directory(store.clone());
        let id = NodeId::from("m1");
        registry.register(id.clone(), Role::Member, 0);
        registry.observe_tip(&id, tip(3), 50);

        let stored = store.list_nodes(&NodeFilter::all()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].reported_height, Some(3));

        let reloaded = NodeRegistry::new().with_directory(store);
        assert_eq!(reloaded.load_directory(), 1);
        assert_eq!(reloaded.get(&id).unwrap().last_seen_ms, 50);
    }

    #[test]
    fn test_concurrent_updates_leave_directory_current() {
        let store = Arc::new(MemoryLedgerStore::new());
        let registry = NodeRegistry::new().with_directory(store.clone());
        let id = NodeId::from("m2");
        registry.register(id.clone(), Role::Member, 0);

        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let registry = &registry;
                let id = &id;
                scope.spawn(move || {
                    for step in 0..200u64 {
                        let height = step * 4 + worker;
                        registry.observe_tip(id, tip(height), height);
                        if step % 7 == 0 {
                            registry.set_status(id, NodeStatus::Syncing);
                        }
                    }
                });
            }
        });

        let stored = store.list_nodes(&NodeFilter::all()).unwrap();
        assert_eq!(stored, vec![registry.get(&id).unwrap()]);
        assert_eq!(stored[0].reported_height, Some(799));
    }
}
