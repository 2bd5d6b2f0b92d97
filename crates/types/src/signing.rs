//! Block signing and pluggable signature verification.
//!
//! Consensus and sync never care which signature scheme is in use; they only
//! call [`SignatureVerifier::verify`]. The bundled implementation is Ed25519
//! keyed by node id.

use crate::NodeId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;

/// Verifies a signature produced by a named node.
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` if `signature` is `signer`'s valid signature over `message`.
    fn verify(&self, signer: &NodeId, message: &[u8], signature: &[u8]) -> bool;
}

/// An Ed25519 signing key bound to the node that owns it.
#[derive(Clone)]
pub struct NodeKeypair {
    node_id: NodeId,
    signing_key: SigningKey,
}

impl NodeKeypair {
    /// Derive a key pair from a 32-byte seed.
    pub fn from_seed(node_id: NodeId, seed: [u8; 32]) -> Self {
        Self {
            node_id,
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Public keys of every node allowed to sign blocks.
#[derive(Debug, Clone, Default)]
pub struct KeyDirectory {
    keys: HashMap<NodeId, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node_id: NodeId, key: VerifyingKey) {
        self.keys.insert(node_id, key);
    }

    pub fn with_keypair(mut self, keypair: &NodeKeypair) -> Self {
        self.insert(keypair.node_id().clone(), keypair.verifying_key());
        self
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.keys.contains_key(node_id)
    }
}

impl SignatureVerifier for KeyDirectory {
    fn verify(&self, signer: &NodeId, message: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.keys.get(signer) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}
