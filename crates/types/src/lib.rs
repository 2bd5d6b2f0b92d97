//! Core types for the consortium ledger.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Primitives**: `Hash`, merkle roots, node identifiers
//! - **Ledger types**: `Block`, `Transaction`, `BlockBundle`, `ChainTip`
//! - **Consensus records**: `LogEntry`, `Vote`, `ConsensusRole`, `ConsensusEvent`
//! - **Signing**: `SignatureVerifier`, `NodeKeypair`, `KeyDirectory`
//!
//! It does not depend on any other workspace crate.

mod block;
mod consensus;
mod event;
mod hash;
mod node;
mod signing;
mod transaction;

pub use block::{proof_of_authority_nonce, Block, BlockBundle, ChainTip, GENESIS_HEIGHT};
pub use consensus::{ConsensusRole, LogEntry, Vote};
pub use event::{ConsensusEvent, EventKind};
pub use hash::{merkle_root, Hash, HexError};
pub use node::{NodeId, NodeRecord, NodeStatus, Role};
pub use signing::{KeyDirectory, NodeKeypair, SignatureVerifier};
pub use transaction::{Transaction, TransactionStatus};
