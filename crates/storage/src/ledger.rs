//! Ledger store trait.
//!
//! All methods take `&self`; implementations use interior mutability.

use crate::StorageError;
use consortium_types::{
    Block, BlockBundle, ChainTip, ConsensusEvent, Hash, NodeId, NodeRecord, NodeStatus, Role,
    Transaction,
};
use serde::{Deserialize, Serialize};

/// Store-local block row identifier.
///
/// Only meaningful inside the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block row together with its store-local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    /// Store-local id.
    pub id: BlockId,
    /// The block itself.
    pub block: Block,
}

/// Consensus metadata that must survive restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMeta {
    /// Last term this node operated in.
    pub current_term: u64,
    /// Highest term observed from any other node.
    pub last_known_cluster_term: u64,
}

/// Filter for [`LedgerStore::list_nodes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Only nodes with this role.
    pub role: Option<Role>,
    /// Only nodes with this status.
    pub status: Option<NodeStatus>,
}

impl NodeFilter {
    /// Match every node.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match nodes with the given role.
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            status: None,
        }
    }

    /// Restrict to the given status.
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether `record` passes this filter.
    pub fn matches(&self, record: &NodeRecord) -> bool {
        self.role.map_or(true, |r| r == record.role)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// Write handle passed to [`LedgerStore::write_atomically`].
///
/// Reads made by the writer observe writes staged earlier in the same
/// transaction.
pub trait BlockWriter {
    /// Insert a block unless one with the same hash already sits at its height.
    ///
    /// Returns the store-local id of the (new or existing) row. A different
    /// block at the same height is a [`StorageError::Conflict`].
    fn insert_block_if_absent(&mut self, block: &Block) -> Result<BlockId, StorageError>;

    /// Insert a transaction keyed by its global id. Existing rows are left untouched.
    fn insert_transaction_if_absent(&mut self, tx: &Transaction) -> Result<(), StorageError>;

    /// Link a transaction to a block. Existing links are left untouched.
    ///
    /// Both rows must exist, either stored or staged in this transaction.
    fn insert_block_transaction_link(
        &mut self,
        block_id: BlockId,
        tx_id: &str,
    ) -> Result<(), StorageError>;
}

/// Per-node ledger store.
pub trait LedgerStore: Send + Sync {
    /// List directory entries matching `filter`, ordered by node id.
    fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StorageError>;

    /// Insert or replace a directory entry.
    fn upsert_node(&self, record: &NodeRecord) -> Result<(), StorageError>;

    /// Record a node's latest known tip and contact time.
    ///
    /// Unknown nodes are ignored; entries are only created by [`Self::upsert_node`].
    fn update_node_state(
        &self,
        node_id: &NodeId,
        height: u64,
        hash: Hash,
        last_seen_ms: u64,
    ) -> Result<(), StorageError>;

    /// Highest block held by this store.
    fn get_last_block(&self) -> Result<Option<StoredBlock>, StorageError>;

    /// Block at `height`, if present.
    fn get_block_at_height(&self, height: u64) -> Result<Option<StoredBlock>, StorageError>;

    /// Transactions linked to a block, in the order they were linked.
    fn get_transactions_for_block(
        &self,
        block_id: BlockId,
    ) -> Result<Vec<Transaction>, StorageError>;

    /// Transaction by global id.
    fn get_transaction(&self, tx_id: &str) -> Result<Option<Transaction>, StorageError>;

    /// Run `op` against a [`BlockWriter`] inside one atomic transaction.
    ///
    /// If `op` returns an error, nothing it wrote is kept.
    fn write_atomically(
        &self,
        op: &mut dyn FnMut(&mut dyn BlockWriter) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;

    /// Append to the consensus event log.
    fn record_event(&self, event: &ConsensusEvent) -> Result<(), StorageError>;

    /// Most recent events, newest last.
    fn recent_events(&self, limit: usize) -> Result<Vec<ConsensusEvent>, StorageError>;

    /// Load persisted consensus metadata.
    fn load_consensus_meta(&self) -> Result<Option<ConsensusMeta>, StorageError>;

    /// Persist consensus metadata.
    fn save_consensus_meta(&self, meta: &ConsensusMeta) -> Result<(), StorageError>;

    // ── Provided ─────────────────────────────────────────────────────

    /// Height and hash of the last block.
    fn tip(&self) -> Result<Option<ChainTip>, StorageError> {
        Ok(self.get_last_block()?.map(|stored| stored.block.tip()))
    }

    /// Block at `height` with its full ordered transaction set.
    fn get_bundle_at_height(&self, height: u64) -> Result<Option<BlockBundle>, StorageError> {
        let Some(stored) = self.get_block_at_height(height)? else {
            return Ok(None);
        };
        let transactions = self.get_transactions_for_block(stored.id)?;
        Ok(Some(BlockBundle::new(stored.block, transactions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_filter() {
        let authority = NodeRecord::new(NodeId::from("a"), Role::Authority, 0);
        let mut member = NodeRecord::new(NodeId::from("m"), Role::Member, 0);
        member.status = NodeStatus::Unreachable;

        assert!(NodeFilter::all().matches(&authority));
        assert!(NodeFilter::role(Role::Member).matches(&member));
        assert!(!NodeFilter::role(Role::Member).matches(&authority));
        assert!(!NodeFilter::role(Role::Member)
            .with_status(NodeStatus::Active)
            .matches(&member));
    }
}
