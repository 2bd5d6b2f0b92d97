use consortium_storage::{
    BlockId, BlockWriter, ConsensusMeta, LedgerStore, NodeFilter, StorageError, StoredBlock,
};
use consortium_types::{Block, ConsensusEvent, Hash, NodeId, NodeRecord, Transaction};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct LedgerTables {
    blocks: BTreeMap<u64, StoredBlock>,
    heights: HashMap<BlockId, u64>,
    next_block_id: u64,
    transactions: HashMap<String, Transaction>,
    /// Per block, tx ids in link order.
    links: HashMap<BlockId, Vec<String>>,
}

/// In-memory ledger store.
///
/// All state sits behind `RwLock`s so every method takes `&self`.
pub struct MemoryLedgerStore {
    ledger: RwLock<LedgerTables>,
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
    events: RwLock<Vec<ConsensusEvent>>,
    meta: RwLock<Option<ConsensusMeta>>,
    available: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            ledger: RwLock::new(LedgerTables::default()),
            nodes: RwLock::new(BTreeMap::new()),
            events: RwLock::new(Vec::new()),
            meta: RwLock::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage. While unavailable every operation fails with
    /// [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.ledger.read().blocks.len()
    }

    /// Number of stored block/transaction links.
    pub fn link_count(&self) -> usize {
        self.ledger.read().links.values().map(Vec::len).sum()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes staged by one atomic operation, merged only on success.
#[derive(Default)]
struct Stage {
    blocks: BTreeMap<u64, StoredBlock>,
    transactions: HashMap<String, Transaction>,
    links: Vec<(BlockId, String)>,
    next_block_id: u64,
}

impl Stage {
    fn merge_into(self, tables: &mut LedgerTables) {
        for (height, stored) in self.blocks {
            tables.heights.insert(stored.id, height);
            tables.blocks.insert(height, stored);
        }
        tables.transactions.extend(self.transactions);
        for (block_id, tx_id) in self.links {
            tables.links.entry(block_id).or_default().push(tx_id);
        }
        tables.next_block_id = self.next_block_id;
    }
}

/// Reads through the stage to the committed tables.
struct StagedWriter<'a> {
    base: &'a LedgerTables,
    stage: &'a mut Stage,
}

impl StagedWriter<'_> {
    fn block_at(&self, height: u64) -> Option<&StoredBlock> {
        self.stage
            .blocks
            .get(&height)
            .or_else(|| self.base.blocks.get(&height))
    }

    fn block_exists(&self, id: BlockId) -> bool {
        self.base.heights.contains_key(&id) || self.stage.blocks.values().any(|b| b.id == id)
    }

    fn transaction_exists(&self, tx_id: &str) -> bool {
        self.stage.transactions.contains_key(tx_id) || self.base.transactions.contains_key(tx_id)
    }

    fn link_exists(&self, block_id: BlockId, tx_id: &str) -> bool {
        self.stage
            .links
            .iter()
            .any(|(id, tx)| *id == block_id && tx == tx_id)
            || self
                .base
                .links
                .get(&block_id)
                .is_some_and(|txs| txs.iter().any(|tx| tx == tx_id))
    }
}

impl BlockWriter for StagedWriter<'_> {
    fn insert_block_if_absent(&mut self, block: &Block) -> Result<BlockId, StorageError> {
        if let Some(existing) = self.block_at(block.height) {
            if existing.block.hash != block.hash {
                return Err(StorageError::Conflict {
                    height: block.height,
                    existing: existing.block.hash,
                    incoming: block.hash,
                });
            }
            return Ok(existing.id);
        }

        self.stage.next_block_id += 1;
        let id = BlockId(self.stage.next_block_id);
        self.stage.blocks.insert(
            block.height,
            StoredBlock {
                id,
                block: block.clone(),
            },
        );
        Ok(id)
    }

    fn insert_transaction_if_absent(&mut self, tx: &Transaction) -> Result<(), StorageError> {
        if !self.transaction_exists(&tx.id) {
            self.stage.transactions.insert(tx.id.clone(), tx.clone());
        }
        Ok(())
    }

    fn insert_block_transaction_link(
        &mut self,
        block_id: BlockId,
        tx_id: &str,
    ) -> Result<(), StorageError> {
        if !self.block_exists(block_id) || !self.transaction_exists(tx_id) {
            return Err(StorageError::DanglingLink {
                block_id: block_id.0,
                tx_id: tx_id.to_string(),
            });
        }
        if !self.link_exists(block_id, tx_id) {
            self.stage.links.push((block_id, tx_id.to_string()));
        }
        Ok(())
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StorageError> {
        self.check_available()?;
        Ok(self
            .nodes
            .read()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    fn upsert_node(&self, record: &NodeRecord) -> Result<(), StorageError> {
        self.check_available()?;
        self.nodes.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn update_node_state(
        &self,
        node_id: &NodeId,
        height: u64,
        hash: Hash,
        last_seen_ms: u64,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        if let Some(record) = self.nodes.write().get_mut(node_id) {
            record.reported_height = Some(height);
            record.last_block_hash = Some(hash);
            record.last_seen_ms = last_seen_ms;
        }
        Ok(())
    }

    fn get_last_block(&self) -> Result<Option<StoredBlock>, StorageError> {
        self.check_available()?;
        Ok(self
            .ledger
            .read()
            .blocks
            .last_key_value()
            .map(|(_, stored)| stored.clone()))
    }

    fn get_block_at_height(&self, height: u64) -> Result<Option<StoredBlock>, StorageError> {
        self.check_available()?;
        Ok(self.ledger.read().blocks.get(&height).cloned())
    }

    fn get_transactions_for_block(
        &self,
        block_id: BlockId,
    ) -> Result<Vec<Transaction>, StorageError> {
        self.check_available()?;
        let ledger = self.ledger.read();
        let Some(tx_ids) = ledger.links.get(&block_id) else {
            return Ok(Vec::new());
        };
        tx_ids
            .iter()
            .map(|tx_id| {
                ledger.transactions.get(tx_id).cloned().ok_or_else(|| {
                    StorageError::DanglingLink {
                        block_id: block_id.0,
                        tx_id: tx_id.clone(),
                    }
                })
            })
            .collect()
    }

    fn get_transaction(&self, tx_id: &str) -> Result<Option<Transaction>, StorageError> {
        self.check_available()?;
        Ok(self.ledger.read().transactions.get(tx_id).cloned())
    }

    fn write_atomically(
        &self,
        op: &mut dyn FnMut(&mut dyn BlockWriter) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        let mut ledger = self.ledger.write();

        let mut stage = Stage {
            next_block_id: ledger.next_block_id,
            ..Stage::default()
        };
        op(&mut StagedWriter {
            base: &ledger,
            stage: &mut stage,
        })?;

        stage.merge_into(&mut ledger);
        Ok(())
    }

    fn record_event(&self, event: &ConsensusEvent) -> Result<(), StorageError> {
        self.check_available()?;
        self.events.write().push(event.clone());
        Ok(())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<ConsensusEvent>, StorageError> {
        self.check_available()?;
        let events = self.events.read();
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    fn load_consensus_meta(&self) -> Result<Option<ConsensusMeta>, StorageError> {
        self.check_available()?;
        Ok(*self.meta.read())
    }

    fn save_consensus_meta(&self, meta: &ConsensusMeta) -> Result<(), StorageError> {
        self.check_available()?;
        *self.meta.write() = Some(*meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_storage::test_helpers::{self, keypair, make_chain, write_bundle};
    use consortium_storage::StoreRegistry;
    use std::sync::Arc;

    #[test]
    fn test_block_roundtrip() {
        test_helpers::check_block_roundtrip(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_idempotent_insert() {
        test_helpers::check_idempotent_insert(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_atomic_rollback() {
        test_helpers::check_atomic_rollback(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_conflicting_block_rejected() {
        test_helpers::check_conflicting_block_rejected(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_dangling_link_rejected() {
        test_helpers::check_dangling_link_rejected(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_relink_is_noop() {
        test_helpers::check_relink_is_noop(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_node_directory() {
        test_helpers::check_node_directory(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_events_and_meta() {
        test_helpers::check_events_and_meta(&MemoryLedgerStore::new());
    }

    #[test]
    fn test_outage_rejects_everything() {
        let store = MemoryLedgerStore::new();
        let chain = make_chain(&keypair("authority", 1), 2, 1);
        write_bundle(&store, &chain[0]).unwrap();

        store.set_available(false);
        assert!(matches!(
            write_bundle(&store, &chain[1]),
            Err(StorageError::Unavailable(_))
        ));
        assert!(store.get_last_block().is_err());

        store.set_available(true);
        assert_eq!(store.block_count(), 1);
        write_bundle(&store, &chain[1]).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.link_count(), 1);
    }

    #[test]
    fn test_registry_resolves_shared_handles() {
        let registry = StoreRegistry::new();
        let node = NodeId::from("member-1");
        let first = registry.register(node.clone(), Arc::new(MemoryLedgerStore::new()));
        let again = registry.register(node.clone(), Arc::new(MemoryLedgerStore::new()));

        let chain = make_chain(&keypair("authority", 1), 1, 0);
        write_bundle(first.store(), &chain[0]).unwrap();

        // Re-registration keeps the original store.
        assert!(again.store().get_block_at_height(0).unwrap().is_some());
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.resolve(&NodeId::from("ghost")),
            Err(StorageError::UnknownTarget(_))
        ));
        assert_eq!(registry.resolve(&node).unwrap().node_id(), &node);
    }
}
