//! Replication of committed blocks across per-node stores.
//!
//! - [`NodeRegistry`]: directory of known nodes with their reported tips.
//! - [`apply_block`]: the single idempotent apply path. Every write of a
//!   block into a store, live or catch-up, goes through it under the
//!   target's writer lock.
//! - [`BlockReplicator`]: fans a committed block out to every registered
//!   store in parallel and reports the outcome per target.
//! - [`SyncProtocol`]: pulls, validates and applies missing heights from a
//!   peer in strictly ascending order, stopping at the first bad block.
//! - [`validate_block`] / [`validate_chain`]: block and whole-chain checks.

mod apply;
mod error;
mod registry;
mod replicator;
mod sync;
mod validation;

pub use apply::{apply_block, ApplyOutcome};
pub use error::{FetchError, ReplicationError, SyncError, ValidationError};
pub use registry::{NodeRegistry, RegistryStatistics};
pub use replicator::{BlockReplicator, ReplicationReport, TargetOutcome};
pub use sync::{BlockSource, StoreBlockSource, SyncProtocol, SyncReport};
pub use validation::{validate_block, validate_chain};
