//! # In-Memory Storage
//!
//! In-memory [`LedgerStore`](consortium_storage::LedgerStore) used by tests
//! and the simulator.
//!
//! Atomic writes stage into an overlay and are merged under the table lock
//! only when the whole operation succeeds. The store can be switched
//! unavailable to simulate an outage of one node's storage.

mod storage;

pub use storage::MemoryLedgerStore;
