//! Blocks, chain tips and block sealing.

use crate::{merkle_root, Hash, NodeId, NodeKeypair, Transaction};
use serde::{Deserialize, Serialize};

/// Height of the genesis block.
pub const GENESIS_HEIGHT: u64 = 0;

/// A sealed, signed block.
///
/// The block hash commits to height, timestamp, previous hash, signer, nonce,
/// merkle root and the ordered transaction hashes, so verifying it requires
/// the block's transaction set (see [`BlockBundle`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: Hash,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    /// Unix milliseconds when the block was sealed.
    pub timestamp_ms: u64,
    /// Node that sealed and signed the block.
    pub signer: NodeId,
    pub nonce: u64,
    /// Time the leader spent assembling the block. Not covered by the hash.
    pub duration_ms: u64,
    pub tx_count: u32,
    /// Signer's signature over the block hash.
    pub authority_signature: Vec<u8>,
}

impl Block {
    /// Create the genesis block at height 0, linked to [`Hash::ZERO`].
    pub fn genesis(keypair: &NodeKeypair, timestamp_ms: u64) -> Self {
        Self::seal(GENESIS_HEIGHT, Hash::ZERO, timestamp_ms, keypair, &[])
    }

    /// Seal a block over `transactions` and sign it with `keypair`.
    pub fn seal(
        height: u64,
        previous_hash: Hash,
        timestamp_ms: u64,
        keypair: &NodeKeypair,
        transactions: &[Transaction],
    ) -> Self {
        let tx_hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash).collect();
        let merkle_root = merkle_root(&tx_hashes);
        let nonce = proof_of_authority_nonce(height, &previous_hash);
        let signer = keypair.node_id().clone();
        let hash = Self::compute_hash(
            height,
            timestamp_ms,
            &previous_hash,
            &signer,
            nonce,
            &merkle_root,
            &tx_hashes,
        );

        Self {
            height,
            hash,
            previous_hash,
            merkle_root,
            timestamp_ms,
            signer,
            nonce,
            duration_ms: 0,
            tx_count: transactions.len() as u32,
            authority_signature: keypair.sign(hash.as_bytes()),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Canonical block hash.
    pub fn compute_hash(
        height: u64,
        timestamp_ms: u64,
        previous_hash: &Hash,
        signer: &NodeId,
        nonce: u64,
        merkle_root: &Hash,
        tx_hashes: &[Hash],
    ) -> Hash {
        let signer = signer.as_str().as_bytes();
        let signer_len = (signer.len() as u32).to_be_bytes();
        let tx_count = (tx_hashes.len() as u32).to_be_bytes();
        let height = height.to_be_bytes();
        let timestamp = timestamp_ms.to_be_bytes();
        let nonce = nonce.to_be_bytes();

        let head: [&[u8]; 9] = [
            b"block:",
            &height,
            &timestamp,
            previous_hash.as_bytes(),
            &signer_len,
            signer,
            &nonce,
            merkle_root.as_bytes(),
            &tx_count,
        ];
        let mut parts = head.to_vec();
        parts.extend(tx_hashes.iter().map(|h| h.as_bytes().as_slice()));
        Hash::from_parts(&parts)
    }

    /// Recompute this block's hash against a given transaction hash list.
    pub fn recompute_hash(&self, tx_hashes: &[Hash]) -> Hash {
        Self::compute_hash(
            self.height,
            self.timestamp_ms,
            &self.previous_hash,
            &self.signer,
            self.nonce,
            &self.merkle_root,
            tx_hashes,
        )
    }

    pub fn is_genesis(&self) -> bool {
        self.height == GENESIS_HEIGHT
    }

    pub fn tip(&self) -> ChainTip {
        ChainTip {
            height: self.height,
            hash: self.hash,
        }
    }
}

/// Deterministic proof-of-authority nonce for a block position.
///
/// First four bytes of `hash(height || previous_hash)`, big-endian.
pub fn proof_of_authority_nonce(height: u64, previous_hash: &Hash) -> u64 {
    let digest = Hash::from_parts(&[&height.to_be_bytes(), previous_hash.as_bytes()]);
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
}

/// Height and hash of the last block a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash,
}

/// A block together with its complete, ordered transaction set.
///
/// This is the unit of replication and sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBundle {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

impl BlockBundle {
    pub fn new(block: Block, transactions: Vec<Transaction>) -> Self {
        Self {
            block,
            transactions,
        }
    }

    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyDirectory, SignatureVerifier};

    fn authority() -> NodeKeypair {
        NodeKeypair::from_seed(NodeId::from("authority"), [7; 32])
    }

    fn txs() -> Vec<Transaction> {
        (0..3)
            .map(|i| Transaction::new(format!("tx-{i}"), "alice", "bob", 10 + i, 1_000))
            .collect()
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(&authority(), 0);
        assert!(genesis.is_genesis());
        assert_eq!(genesis.previous_hash, Hash::ZERO);
        assert_eq!(genesis.tx_count, 0);
        assert_eq!(genesis.merkle_root, merkle_root(&[]));
        assert_eq!(genesis.recompute_hash(&[]), genesis.hash);
    }

    #[test]
    fn test_seal_commits_to_transactions() {
        let keypair = authority();
        let genesis = Block::genesis(&keypair, 0);
        let txs = txs();
        let block = Block::seal(1, genesis.hash, 5_000, &keypair, &txs);
        let bundle = BlockBundle::new(block.clone(), txs);

        assert_eq!(block.tx_count, 3);
        assert_eq!(block.merkle_root, merkle_root(&bundle.tx_hashes()));
        assert_eq!(block.recompute_hash(&bundle.tx_hashes()), block.hash);

        let mut reordered = bundle.tx_hashes();
        reordered.swap(0, 2);
        assert_ne!(block.recompute_hash(&reordered), block.hash);
    }

    #[test]
    fn test_seal_signature_verifies() {
        let keypair = authority();
        let block = Block::seal(1, Hash::ZERO, 5_000, &keypair, &txs());
        let directory = KeyDirectory::new().with_keypair(&keypair);
        assert!(directory.verify(&block.signer, block.hash.as_bytes(), &block.authority_signature));
    }

    #[test]
    fn test_nonce_is_deterministic_per_position() {
        let prev = Hash::from_bytes(b"prev");
        assert_eq!(
            proof_of_authority_nonce(4, &prev),
            proof_of_authority_nonce(4, &prev)
        );
        assert_ne!(
            proof_of_authority_nonce(4, &prev),
            proof_of_authority_nonce(5, &prev)
        );
        assert!(proof_of_authority_nonce(4, &prev) <= u32::MAX as u64);
    }

    #[test]
    fn test_duration_not_hashed() {
        let keypair = authority();
        let block = Block::seal(1, Hash::ZERO, 5_000, &keypair, &[]).with_duration_ms(42);
        assert_eq!(block.recompute_hash(&[]), block.hash);
    }
}
