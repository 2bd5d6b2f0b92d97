//! Test helpers for the ledger: deterministic keys, chain fixtures and
//! whole in-memory clusters.
//!
//! ```rust,no_run
//! use consortium_test_helpers::ClusterBuilder;
//!
//! # async fn demo() {
//! let cluster = ClusterBuilder::new(3).build();
//! cluster.start_all().await;
//! let outcome = cluster.append(&cluster.authority_id(), 2).await.unwrap();
//! assert!(outcome.committed);
//! # }
//! ```

mod cluster;
pub mod fixtures;

pub use cluster::{ClusterBuilder, TestCluster};

use consortium_types::{KeyDirectory, NodeId, NodeKeypair};
use std::collections::BTreeMap;

/// Id of the Authority in generated clusters.
pub const AUTHORITY: &str = "authority";

/// Id of the `n`th Member (1-based) in generated clusters.
pub fn member_id(n: usize) -> NodeId {
    NodeId::new(format!("member-{n}"))
}

/// Deterministic Ed25519 key pairs for a set of nodes.
#[derive(Debug, Clone)]
pub struct TestKeys {
    keypairs: BTreeMap<NodeId, NodeKeypair>,
}

impl TestKeys {
    /// Keys for `nodes`. The same seed always yields the same keys.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>, seed: u64) -> Self {
        let keypairs = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node_id)| {
                let mut bytes = [0u8; 32];
                let mixed = seed.wrapping_add(i as u64).wrapping_mul(0x517c_c1b7_2722_0a95);
                bytes[..8].copy_from_slice(&mixed.to_le_bytes());
                bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                bytes[16..24].copy_from_slice(&seed.to_le_bytes());
                (node_id.clone(), NodeKeypair::from_seed(node_id, bytes))
            })
            .collect();
        Self { keypairs }
    }

    /// # Panics
    ///
    /// Panics if `node_id` has no key.
    pub fn keypair(&self, node_id: &NodeId) -> &NodeKeypair {
        &self.keypairs[node_id]
    }

    /// Public keys of every node.
    pub fn directory(&self) -> KeyDirectory {
        self.keypairs
            .values()
            .fold(KeyDirectory::new(), |dir, kp| dir.with_keypair(kp))
    }

    pub fn len(&self) -> usize {
        self.keypairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_types::SignatureVerifier;

    #[test]
    fn test_keys_are_deterministic() {
        let ids = || [NodeId::from(AUTHORITY), member_id(1)];
        let a = TestKeys::new(ids(), 42);
        let b = TestKeys::new(ids(), 42);
        let c = TestKeys::new(ids(), 43);
        let id = NodeId::from(AUTHORITY);
        assert_eq!(a.keypair(&id).verifying_key(), b.keypair(&id).verifying_key());
        assert_ne!(a.keypair(&id).verifying_key(), c.keypair(&id).verifying_key());
    }

    #[test]
    fn test_directory_verifies_each_signer() {
        let keys = TestKeys::new([NodeId::from(AUTHORITY), member_id(1)], 7);
        let directory = keys.directory();
        let signature = keys.keypair(&member_id(1)).sign(b"block");
        assert!(directory.verify(&member_id(1), b"block", &signature));
        assert!(!directory.verify(&NodeId::from(AUTHORITY), b"block", &signature));
    }
}
