//! # RocksDB Storage
//!
//! Durable [`LedgerStore`](consortium_storage::LedgerStore) backed by RocksDB.
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.
//!
//! Each logical table lives in its own column family. A block, its
//! transactions and its links are staged into one `WriteBatch` and written
//! with a single `write_opt` call, so a crash never leaves a partial block.

mod storage;

pub use storage::{CompressionType, RocksDbConfig, RocksDbLedgerStore};
