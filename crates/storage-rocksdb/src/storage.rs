use consortium_metrics as metrics;
use consortium_storage::{
    BlockId, BlockWriter, ConsensusMeta, LedgerStore, NodeFilter, StorageError, StoredBlock,
};
use consortium_types::{Block, ConsensusEvent, Hash, NodeId, NodeRecord, Transaction};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const BLOCKS_CF: &str = "blocks";
const BLOCK_IDS_CF: &str = "block_ids";
const TRANSACTIONS_CF: &str = "transactions";
const BLOCK_TXS_CF: &str = "block_txs";
const NODES_CF: &str = "nodes";
const EVENTS_CF: &str = "events";

const COLUMN_FAMILIES: [&str; 6] = [
    BLOCKS_CF,
    BLOCK_IDS_CF,
    TRANSACTIONS_CF,
    BLOCK_TXS_CF,
    NODES_CF,
    EVENTS_CF,
];

// Well-known keys in the default column family.
const META_CONSENSUS_KEY: &[u8] = b"meta:consensus";
const META_NEXT_BLOCK_ID_KEY: &[u8] = b"meta:next_block_id";

/// Value stored under a height in the `blocks` column family.
#[derive(Serialize, Deserialize)]
struct BlockRow {
    id: u64,
    block: Block,
}

/// RocksDB-based ledger store.
///
/// Column families:
/// - `blocks`: height (BE) → block row
/// - `block_ids`: block id (BE) → height (BE)
/// - `transactions`: transaction id → transaction
/// - `block_txs`: block id (BE) ‖ transaction id → link position (BE)
/// - `nodes`: node id → directory record
/// - `events`: sequence (BE) → consensus event
pub struct RocksDbLedgerStore {
    db: Arc<DB>,

    /// Serializes atomic writes so staged reads stay consistent with the
    /// batch they end up in. Also orders event sequence allocation.
    write_lock: Mutex<()>,

    sync_writes: bool,
}

impl RocksDbLedgerStore {
    /// Open or create a RocksDB database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(config.compression.to_rocksdb());

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        if let Some(cache_size) = config.block_cache_size {
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
        }
        if config.bloom_filter_bits > 0.0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors: Vec<_> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(config.compression.to_rocksdb());
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors).map_err(backend)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
            sync_writes: config.sync_writes,
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        column_family(&self.db, name)
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        write_opts
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), StorageError> {
        let cf = self.cf(cf)?;
        self.db
            .put_cf_opt(cf, key, encode(value)?, &self.write_options())
            .map_err(backend)
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StorageError> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(cf, key).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn block_at(&self, height: u64) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self
            .get::<BlockRow>(BLOCKS_CF, &height.to_be_bytes())?
            .map(|row| StoredBlock {
                id: BlockId(row.id),
                block: row.block,
            }))
    }

    fn next_block_id(&self) -> Result<u64, StorageError> {
        match self.db.get(META_NEXT_BLOCK_ID_KEY).map_err(backend)? {
            Some(bytes) => decode(&bytes),
            None => Ok(1),
        }
    }

    fn next_event_seq(&self) -> Result<u64, StorageError> {
        let cf = self.cf(EVENTS_CF)?;
        let last = self.db.iterator_cf(cf, IteratorMode::End).next();
        match last {
            Some(item) => {
                let (key, _) = item.map_err(backend)?;
                Ok(be_u64(&key)? + 1)
            }
            None => Ok(0),
        }
    }
}

/// Staged writes for one atomic operation.
///
/// Reads consult the staged rows first, then the database.
struct RocksWriter<'a> {
    store: &'a RocksDbLedgerStore,
    batch: WriteBatch,
    blocks: HashMap<u64, u64>,
    block_hashes: HashMap<u64, Hash>,
    transactions: HashSet<String>,
    /// Links staged per block id, in order.
    links: HashMap<u64, Vec<String>>,
    next_block_id: u64,
    allocated_ids: bool,
}

impl<'a> RocksWriter<'a> {
    fn new(store: &'a RocksDbLedgerStore) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            batch: WriteBatch::default(),
            blocks: HashMap::new(),
            block_hashes: HashMap::new(),
            transactions: HashSet::new(),
            links: HashMap::new(),
            next_block_id: store.next_block_id()?,
            allocated_ids: false,
        })
    }

    fn block_exists(&self, id: u64) -> Result<bool, StorageError> {
        if self.blocks.values().any(|staged| *staged == id) {
            return Ok(true);
        }
        let cf = self.store.cf(BLOCK_IDS_CF)?;
        Ok(self
            .store
            .db
            .get_pinned_cf(cf, id.to_be_bytes())
            .map_err(backend)?
            .is_some())
    }

    fn transaction_exists(&self, tx_id: &str) -> Result<bool, StorageError> {
        if self.transactions.contains(tx_id) {
            return Ok(true);
        }
        let cf = self.store.cf(TRANSACTIONS_CF)?;
        Ok(self
            .store
            .db
            .get_pinned_cf(cf, tx_id.as_bytes())
            .map_err(backend)?
            .is_some())
    }

    fn stored_link_count(&self, block_id: u64) -> Result<u32, StorageError> {
        let cf = self.store.cf(BLOCK_TXS_CF)?;
        let prefix = block_id.to_be_bytes();
        let mut count = 0u32;
        for item in self
            .store
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item.map_err(backend)?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn commit(self) -> Result<usize, StorageError> {
        let mut batch = self.batch;
        if self.allocated_ids {
            batch.put(META_NEXT_BLOCK_ID_KEY, encode(&self.next_block_id)?);
        }
        let size = batch.len();
        self.store
            .db
            .write_opt(batch, &self.store.write_options())
            .map_err(backend)?;
        Ok(size)
    }
}

impl BlockWriter for RocksWriter<'_> {
    fn insert_block_if_absent(&mut self, block: &Block) -> Result<BlockId, StorageError> {
        if let (Some(id), Some(hash)) = (
            self.blocks.get(&block.height),
            self.block_hashes.get(&block.height),
        ) {
            return if *hash == block.hash {
                Ok(BlockId(*id))
            } else {
                Err(StorageError::Conflict {
                    height: block.height,
                    existing: *hash,
                    incoming: block.hash,
                })
            };
        }
        if let Some(existing) = self.store.block_at(block.height)? {
            if existing.block.hash != block.hash {
                return Err(StorageError::Conflict {
                    height: block.height,
                    existing: existing.block.hash,
                    incoming: block.hash,
                });
            }
            return Ok(existing.id);
        }

        let id = self.next_block_id;
        self.next_block_id += 1;
        self.allocated_ids = true;

        let row = BlockRow {
            id,
            block: block.clone(),
        };
        let blocks_cf = self.store.cf(BLOCKS_CF)?;
        let ids_cf = self.store.cf(BLOCK_IDS_CF)?;
        self.batch
            .put_cf(blocks_cf, block.height.to_be_bytes(), encode(&row)?);
        self.batch
            .put_cf(ids_cf, id.to_be_bytes(), block.height.to_be_bytes());

        self.blocks.insert(block.height, id);
        self.block_hashes.insert(block.height, block.hash);
        Ok(BlockId(id))
    }

    fn insert_transaction_if_absent(&mut self, tx: &Transaction) -> Result<(), StorageError> {
        if self.transaction_exists(&tx.id)? {
            return Ok(());
        }
        let cf = self.store.cf(TRANSACTIONS_CF)?;
        self.batch.put_cf(cf, tx.id.as_bytes(), encode(tx)?);
        self.transactions.insert(tx.id.clone());
        Ok(())
    }

    fn insert_block_transaction_link(
        &mut self,
        block_id: BlockId,
        tx_id: &str,
    ) -> Result<(), StorageError> {
        if !self.block_exists(block_id.0)? || !self.transaction_exists(tx_id)? {
            return Err(StorageError::DanglingLink {
                block_id: block_id.0,
                tx_id: tx_id.to_string(),
            });
        }

        let staged = self.links.get(&block_id.0);
        if staged.is_some_and(|txs| txs.iter().any(|tx| tx == tx_id)) {
            return Ok(());
        }
        let key = link_key(block_id.0, tx_id);
        let cf = self.store.cf(BLOCK_TXS_CF)?;
        if self
            .store
            .db
            .get_pinned_cf(cf, &key)
            .map_err(backend)?
            .is_some()
        {
            return Ok(());
        }

        let position = self.stored_link_count(block_id.0)? + staged.map_or(0, |txs| txs.len() as u32);
        self.batch.put_cf(cf, key, position.to_be_bytes());
        self.links
            .entry(block_id.0)
            .or_default()
            .push(tx_id.to_string());
        Ok(())
    }
}

impl LedgerStore for RocksDbLedgerStore {
    fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StorageError> {
        let cf = self.cf(NODES_CF)?;
        let mut nodes = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(backend)?;
            let record: NodeRecord = decode(&value)?;
            if filter.matches(&record) {
                nodes.push(record);
            }
        }
        Ok(nodes)
    }

    fn upsert_node(&self, record: &NodeRecord) -> Result<(), StorageError> {
        self.put(NODES_CF, record.id.as_str().as_bytes(), record)
    }

    fn update_node_state(
        &self,
        node_id: &NodeId,
        height: u64,
        hash: Hash,
        last_seen_ms: u64,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let key = node_id.as_str().as_bytes();
        let Some(mut record) = self.get::<NodeRecord>(NODES_CF, key)? else {
            return Ok(());
        };
        record.reported_height = Some(height);
        record.last_block_hash = Some(hash);
        record.last_seen_ms = last_seen_ms;
        self.put(NODES_CF, key, &record)
    }

    fn get_last_block(&self) -> Result<Option<StoredBlock>, StorageError> {
        let cf = self.cf(BLOCKS_CF)?;
        let last = self.db.iterator_cf(cf, IteratorMode::End).next();
        match last {
            Some(item) => {
                let (_, value) = item.map_err(backend)?;
                let row: BlockRow = decode(&value)?;
                Ok(Some(StoredBlock {
                    id: BlockId(row.id),
                    block: row.block,
                }))
            }
            None => Ok(None),
        }
    }

    fn get_block_at_height(&self, height: u64) -> Result<Option<StoredBlock>, StorageError> {
        self.block_at(height)
    }

    fn get_transactions_for_block(
        &self,
        block_id: BlockId,
    ) -> Result<Vec<Transaction>, StorageError> {
        let start = Instant::now();
        let cf = self.cf(BLOCK_TXS_CF)?;
        let prefix = block_id.0.to_be_bytes();

        let mut positioned = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(&prefix) {
                break;
            }
            let position = be_u32(&value)?;
            let tx_id = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| StorageError::Codec(e.to_string()))?;
            positioned.push((position, tx_id));
        }
        positioned.sort_by_key(|(position, _)| *position);

        let mut transactions = Vec::with_capacity(positioned.len());
        for (_, tx_id) in positioned {
            let tx = self
                .get::<Transaction>(TRANSACTIONS_CF, tx_id.as_bytes())?
                .ok_or_else(|| StorageError::DanglingLink {
                    block_id: block_id.0,
                    tx_id: tx_id.clone(),
                })?;
            transactions.push(tx);
        }

        metrics::record_storage_operation(
            "get_transactions_for_block",
            start.elapsed().as_secs_f64(),
        );
        Ok(transactions)
    }

    fn get_transaction(&self, tx_id: &str) -> Result<Option<Transaction>, StorageError> {
        self.get(TRANSACTIONS_CF, tx_id.as_bytes())
    }

    fn write_atomically(
        &self,
        op: &mut dyn FnMut(&mut dyn BlockWriter) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let start = Instant::now();
        let _guard = self.write_lock.lock();

        let mut writer = RocksWriter::new(self)?;
        op(&mut writer)?;
        let batch_size = writer.commit()?;

        let elapsed = start.elapsed().as_secs_f64();
        metrics::record_storage_operation("write_atomically", elapsed);
        debug!(batch_size, elapsed, "Committed atomic ledger write");
        Ok(())
    }

    fn record_event(&self, event: &ConsensusEvent) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let seq = self.next_event_seq()?;
        self.put(EVENTS_CF, &seq.to_be_bytes(), event)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<ConsensusEvent>, StorageError> {
        let cf = self.cf(EVENTS_CF)?;
        let mut events = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(cf, IteratorMode::End).take(limit) {
            let (_, value) = item.map_err(backend)?;
            events.push(decode(&value)?);
        }
        events.reverse();
        Ok(events)
    }

    fn load_consensus_meta(&self) -> Result<Option<ConsensusMeta>, StorageError> {
        match self.db.get(META_CONSENSUS_KEY).map_err(backend)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_consensus_meta(&self, meta: &ConsensusMeta) -> Result<(), StorageError> {
        self.db
            .put_opt(META_CONSENSUS_KEY, encode(meta)?, &self.write_options())
            .map_err(backend)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Encoding helpers
// ═══════════════════════════════════════════════════════════════════════

fn column_family<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, StorageError> {
    db.cf_handle(name)
        .ok_or_else(|| StorageError::Backend(format!("missing column family {name}")))
}

fn link_key(block_id: u64, tx_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + tx_id.len());
    key.extend_from_slice(&block_id.to_be_bytes());
    key.extend_from_slice(tx_id.as_bytes());
    key
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Codec(e.to_string()))
}

fn be_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Codec(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn be_u32(bytes: &[u8]) -> Result<u32, StorageError> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StorageError::Codec(format!("expected 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_be_bytes(arr))
}

fn backend(e: rocksdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

// ═══════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Compression applied to every column family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Snappy,
    Zlib,
    #[default]
    Lz4,
    Zstd,
}

impl CompressionType {
    fn to_rocksdb(self) -> rocksdb::DBCompressionType {
        match self {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Zlib => rocksdb::DBCompressionType::Zlib,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        }
    }
}

/// Configuration for RocksDB storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    /// Maximum number of background jobs
    pub max_background_jobs: i32,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    /// Maximum number of write buffers
    pub max_write_buffer_number: i32,
    /// Block cache size in bytes (None to disable)
    pub block_cache_size: Option<usize>,
    pub compression: CompressionType,
    /// Bloom filter bits per key (0 to disable)
    pub bloom_filter_bits: f64,
    /// fsync every write. Required for crash safety of applied blocks.
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 2,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
            max_write_buffer_number: 3,
            block_cache_size: Some(64 * 1024 * 1024), // 64MB
            compression: CompressionType::Lz4,
            bloom_filter_bits: 10.0,
            sync_writes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_storage::test_helpers::{self, keypair, make_chain, write_bundle};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksDbLedgerStore) {
        let temp_dir = TempDir::new().unwrap();
        let config = RocksDbConfig {
            sync_writes: false,
            ..RocksDbConfig::default()
        };
        let store = RocksDbLedgerStore::open_with_config(temp_dir.path(), config).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_block_roundtrip() {
        let (_dir, store) = open_temp();
        test_helpers::check_block_roundtrip(&store);
    }

    #[test]
    fn test_idempotent_insert() {
        let (_dir, store) = open_temp();
        test_helpers::check_idempotent_insert(&store);
    }

    #[test]
    fn test_atomic_rollback() {
        let (_dir, store) = open_temp();
        test_helpers::check_atomic_rollback(&store);
    }

    #[test]
    fn test_conflicting_block_rejected() {
        let (_dir, store) = open_temp();
        test_helpers::check_conflicting_block_rejected(&store);
    }

    #[test]
    fn test_dangling_link_rejected() {
        let (_dir, store) = open_temp();
        test_helpers::check_dangling_link_rejected(&store);
    }

    #[test]
    fn test_relink_is_noop() {
        let (_dir, store) = open_temp();
        test_helpers::check_relink_is_noop(&store);
    }

    #[test]
    fn test_node_directory() {
        let (_dir, store) = open_temp();
        test_helpers::check_node_directory(&store);
    }

    #[test]
    fn test_events_and_meta() {
        let (_dir, store) = open_temp();
        test_helpers::check_events_and_meta(&store);
    }

    #[test]
    fn test_reopen_preserves_chain_and_ids() {
        let temp_dir = TempDir::new().unwrap();
        let chain = make_chain(&keypair("authority", 1), 3, 2);

        let first_id = {
            let store = RocksDbLedgerStore::open(temp_dir.path()).unwrap();
            write_bundle(&store, &chain[0]).unwrap();
            write_bundle(&store, &chain[1]).unwrap()
        };

        let store = RocksDbLedgerStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.tip().unwrap(), Some(chain[1].block.tip()));
        assert_eq!(
            store.get_bundle_at_height(1).unwrap().unwrap(),
            chain[1].clone()
        );

        // Ids keep increasing across restarts.
        let next = write_bundle(&store, &chain[2]).unwrap();
        assert!(next > first_id);
    }
}
