//! Storage traits and shared types.
//!
//! Every node owns an independent ledger store with the same logical schema:
//! blocks, transactions, block/transaction links, the node directory, the
//! consensus event log and a small consensus metadata record.
//!
//! # Design
//!
//! Consensus and replication code never know which backend sits behind a
//! store. They resolve a node id to a [`TargetStore`] through the
//! [`StoreRegistry`] and talk to it through [`LedgerStore`]:
//! - `consortium-storage-memory` provides `MemoryLedgerStore`
//! - `consortium-storage-rocksdb` provides `RocksDbLedgerStore`
//!
//! Block identifiers are local to a store. Nothing references rows across
//! stores, so there are no cross-store foreign keys.
//!
//! # Atomicity
//!
//! A block, its transactions and its links are written through
//! [`LedgerStore::write_atomically`]. Either every write issued through the
//! [`BlockWriter`] lands, or none does.

#![warn(missing_docs)]

mod error;
mod ledger;
mod registry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

pub use error::StorageError;
pub use ledger::{BlockId, BlockWriter, ConsensusMeta, LedgerStore, NodeFilter, StoredBlock};
pub use registry::{StoreRegistry, TargetStore};
