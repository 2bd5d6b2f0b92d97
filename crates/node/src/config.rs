//! Node configuration, loadable from TOML.

use crate::NodeError;
use consortium_consensus::{ConsensusConfig, QuorumPolicy};
use consortium_storage::LedgerStore;
use consortium_storage_memory::MemoryLedgerStore;
use consortium_storage_rocksdb::{RocksDbConfig, RocksDbLedgerStore};
use consortium_types::{NodeId, Role};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one [`LedgerNode`](crate::LedgerNode).
///
/// Durations are carried as milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub role: Role,
    pub authority_id: NodeId,
    /// Every Member of the cluster. The Authority is listed separately.
    pub members: Vec<NodeId>,
    pub rpc_timeout_ms: u64,
    pub tick_interval_ms: u64,
    /// Capacity of the broadcast channel behind `subscribe`.
    pub event_buffer: usize,
    pub recent_event_capacity: usize,
    /// Peers silent this long are marked unreachable.
    pub unreachable_after_ms: u64,
    /// Start a catch-up from `tick` whenever a peer reports a higher tip.
    pub auto_sync: bool,
    pub storage: StorageConfig,
    pub consensus: ConsensusSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("authority"),
            role: Role::Authority,
            authority_id: NodeId::from("authority"),
            members: Vec::new(),
            rpc_timeout_ms: 1_000,
            tick_interval_ms: 100,
            event_buffer: 1_024,
            recent_event_capacity: 256,
            unreachable_after_ms: 5_000,
            auto_sync: true,
            storage: StorageConfig::default(),
            consensus: ConsensusSection::default(),
        }
    }
}

impl NodeConfig {
    /// A Member or Authority config for an in-memory cluster.
    pub fn new(node_id: NodeId, authority_id: NodeId, members: Vec<NodeId>) -> Self {
        let role = if node_id == authority_id {
            Role::Authority
        } else {
            Role::Member
        };
        Self {
            node_id,
            role,
            authority_id,
            members,
            ..Self::default()
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    pub fn with_unreachable_after(mut self, after: Duration) -> Self {
        self.unreachable_after_ms = after.as_millis() as u64;
        self
    }

    pub fn with_consensus(mut self, consensus: ConsensusSection) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, NodeError> {
        let config: Self =
            toml::from_str(text).map_err(|e| NodeError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node_id.as_str().is_empty() || self.authority_id.as_str().is_empty() {
            return Err(NodeError::Config("node and authority ids must be set".into()));
        }
        let is_authority = self.node_id == self.authority_id;
        if is_authority != (self.role == Role::Authority) {
            return Err(NodeError::Config(format!(
                "node {} has role {} but the authority is {}",
                self.node_id,
                self.role.as_str(),
                self.authority_id
            )));
        }
        if !is_authority && !self.members.contains(&self.node_id) {
            return Err(NodeError::Config(format!(
                "member {} is missing from the member list",
                self.node_id
            )));
        }
        if self.members.contains(&self.authority_id) {
            return Err(NodeError::Config(
                "the authority must not be listed as a member".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(NodeError::Config(
                "rpc_timeout_ms and tick_interval_ms must be positive".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(NodeError::Config("event_buffer must be positive".into()));
        }
        Ok(())
    }

    /// Every node except this one, Authority first.
    pub fn peers(&self) -> Vec<NodeId> {
        std::iter::once(&self.authority_id)
            .chain(self.members.iter())
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect()
    }

    pub fn role_of(&self, node_id: &NodeId) -> Role {
        if *node_id == self.authority_id {
            Role::Authority
        } else {
            Role::Member
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Backend for this node's own ledger store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Rocksdb {
        path: PathBuf,
        #[serde(default)]
        rocksdb: RocksDbConfig,
    },
}

impl StorageConfig {
    /// Open the configured store. Failure here is terminal.
    pub fn open(&self) -> Result<Arc<dyn LedgerStore>, NodeError> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(MemoryLedgerStore::new())),
            StorageConfig::Rocksdb { path, rocksdb } => {
                let store = RocksDbLedgerStore::open_with_config(path, rocksdb.clone())
                    .map_err(|e| {
                        NodeError::Config(format!("cannot open store at {}: {e}", path.display()))
                    })?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// `[consensus]` table; converted into a [`ConsensusConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: u64,
    pub election_jitter_ms: u64,
    pub election_window_ms: u64,
    pub quorum_policy: QuorumPolicy,
    pub max_entries_per_message: usize,
    pub jitter_seed: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        let defaults = ConsensusConfig::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            election_timeout_ms: defaults.election_timeout.as_millis() as u64,
            election_jitter_ms: defaults.election_jitter.as_millis() as u64,
            election_window_ms: defaults.election_window.as_millis() as u64,
            quorum_policy: defaults.quorum_policy,
            max_entries_per_message: defaults.max_entries_per_message,
            jitter_seed: defaults.jitter_seed,
        }
    }
}

impl ConsensusSection {
    pub fn to_consensus_config(&self) -> ConsensusConfig {
        let mut config = ConsensusConfig::new()
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_election_timeout(
                Duration::from_millis(self.election_timeout_ms),
                Duration::from_millis(self.election_jitter_ms),
            )
            .with_election_window(Duration::from_millis(self.election_window_ms))
            .with_quorum_policy(self.quorum_policy)
            .with_jitter_seed(self.jitter_seed);
        config.max_entries_per_message = self.max_entries_per_message.max(1);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER_TOML: &str = r#"
        node_id = "member-2"
        role = "member"
        authority_id = "authority"
        members = ["member-1", "member-2", "member-3"]
        rpc_timeout_ms = 250

        [storage]
        backend = "memory"

        [consensus]
        election_timeout_ms = 900
        quorum_policy = "full_cluster"
    "#;

    #[test]
    fn test_parse_member_config() {
        let config = NodeConfig::from_toml_str(MEMBER_TOML).unwrap();
        assert_eq!(config.node_id, NodeId::from("member-2"));
        assert_eq!(config.rpc_timeout(), Duration::from_millis(250));
        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(
            config.peers(),
            vec![
                NodeId::from("authority"),
                NodeId::from("member-1"),
                NodeId::from("member-3")
            ]
        );

        let consensus = config.consensus.to_consensus_config();
        assert_eq!(consensus.election_timeout, Duration::from_millis(900));
        assert_eq!(consensus.quorum_policy, QuorumPolicy::FullCluster);
        assert_eq!(consensus.heartbeat_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_role_must_match_authority() {
        let text = r#"
            node_id = "member-1"
            role = "authority"
            authority_id = "authority"
            members = ["member-1"]
        "#;
        let err = NodeConfig::from_toml_str(text).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_rocksdb_backend_parses() {
        let text = r#"
            [storage]
            backend = "rocksdb"
            path = "/var/lib/consortium"

            [storage.rocksdb]
            sync_writes = false
        "#;
        let config = NodeConfig::from_toml_str(text).unwrap();
        match config.storage {
            StorageConfig::Rocksdb { path, rocksdb } => {
                assert_eq!(path, PathBuf::from("/var/lib/consortium"));
                assert!(!rocksdb.sync_writes);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_open_rocksdb_store() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::Rocksdb {
            path: dir.path().join("ledger"),
            rocksdb: RocksDbConfig::default(),
        };
        let store = storage.open().unwrap();
        assert!(store.get_last_block().unwrap().is_none());
    }
}
