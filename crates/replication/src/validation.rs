//! Block and chain validation.

use crate::ValidationError;
use consortium_storage::{LedgerStore, StorageError};
use consortium_types::{
    merkle_root, BlockBundle, ChainTip, Hash, SignatureVerifier, GENESIS_HEIGHT,
};
use tracing::warn;

/// Verify `bundle` as the successor of `parent` (`None`: genesis).
///
/// Checks, in order: height and previous-hash linkage, each transaction's
/// own hash, the declared transaction count, the merkle root, the block
/// hash, and the signer's signature over the block hash.
pub fn validate_block(
    bundle: &BlockBundle,
    parent: Option<&ChainTip>,
    verifier: &dyn SignatureVerifier,
) -> Result<(), ValidationError> {
    let block = &bundle.block;
    let (expected_height, expected_previous) = match parent {
        Some(tip) => (tip.height + 1, tip.hash),
        None => (GENESIS_HEIGHT, Hash::ZERO),
    };
    if block.height != expected_height {
        return Err(ValidationError::HeightMismatch {
            expected: expected_height,
            got: block.height,
        });
    }
    if block.previous_hash != expected_previous {
        return Err(ValidationError::PreviousHashMismatch {
            height: block.height,
            expected: expected_previous,
            got: block.previous_hash,
        });
    }

    if let Some(tx) = bundle.transactions.iter().find(|tx| !tx.hash_is_valid()) {
        return Err(ValidationError::TransactionHashMismatch {
            height: block.height,
            tx_id: tx.id.clone(),
        });
    }
    if block.tx_count as usize != bundle.transactions.len() {
        return Err(ValidationError::TxCountMismatch {
            height: block.height,
            declared: block.tx_count,
            actual: bundle.transactions.len(),
        });
    }

    let tx_hashes = bundle.tx_hashes();
    let computed_root = merkle_root(&tx_hashes);
    if computed_root != block.merkle_root {
        return Err(ValidationError::MerkleMismatch {
            height: block.height,
            claimed: block.merkle_root,
            computed: computed_root,
        });
    }

    let computed_hash = block.recompute_hash(&tx_hashes);
    if computed_hash != block.hash {
        return Err(ValidationError::HashMismatch {
            height: block.height,
            claimed: block.hash,
            computed: computed_hash,
        });
    }

    if !verifier.verify(&block.signer, block.hash.as_bytes(), &block.authority_signature) {
        return Err(ValidationError::BadSignature {
            height: block.height,
            signer: block.signer.clone(),
        });
    }
    Ok(())
}

/// Walk a store from genesis to its tip and return every height that does
/// not verify, including heights missing from the store.
///
/// Each block is checked against the block actually stored below it, so a
/// single bad block does not flag its successors.
pub fn validate_chain(
    store: &dyn LedgerStore,
    verifier: &dyn SignatureVerifier,
) -> Result<Vec<u64>, StorageError> {
    let Some(tip) = store.tip()? else {
        return Ok(Vec::new());
    };

    let mut invalid = Vec::new();
    let mut parent: Option<ChainTip> = None;
    for height in GENESIS_HEIGHT..=tip.height {
        let Some(bundle) = store.get_bundle_at_height(height)? else {
            warn!(height, "Chain has a gap");
            invalid.push(height);
            parent = None;
            continue;
        };
        let linked_parent = match (&parent, height) {
            (_, GENESIS_HEIGHT) => None,
            (Some(tip), _) => Some(*tip),
            // Predecessor missing: check this block against its own claim.
            (None, _) => Some(ChainTip {
                height: height - 1,
                hash: bundle.block.previous_hash,
            }),
        };
        if let Err(error) = validate_block(&bundle, linked_parent.as_ref(), verifier) {
            warn!(height, %error, "Stored block failed validation");
            invalid.push(height);
        }
        parent = Some(bundle.block.tip());
    }
    Ok(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_storage::test_helpers::{keypair, make_chain, make_transactions, write_bundle};
    use consortium_storage_memory::MemoryLedgerStore;
    use consortium_types::{Block, KeyDirectory, NodeKeypair, Transaction};

    fn setup() -> (NodeKeypair, KeyDirectory, Vec<BlockBundle>) {
        let authority = keypair("authority", 1);
        let keys = KeyDirectory::new().with_keypair(&authority);
        let chain = make_chain(&authority, 4, 3);
        (authority, keys, chain)
    }

    #[test]
    fn test_valid_chain_passes() {
        let (_, keys, chain) = setup();
        let mut parent = None;
        for bundle in &chain {
            validate_block(bundle, parent.as_ref(), &keys).unwrap();
            parent = Some(bundle.block.tip());
        }
    }

    #[test]
    fn test_linkage_errors() {
        let (_, keys, chain) = setup();
        let genesis_tip = chain[0].block.tip();

        assert!(matches!(
            validate_block(&chain[2], Some(&genesis_tip), &keys),
            Err(ValidationError::HeightMismatch { expected: 1, got: 2 })
        ));
        let wrong = ChainTip {
            height: 0,
            hash: Hash::from_bytes(b"other"),
        };
        assert!(matches!(
            validate_block(&chain[1], Some(&wrong), &keys),
            Err(ValidationError::PreviousHashMismatch { height: 1, .. })
        ));
    }

    #[test]
    fn test_swapped_transaction_is_merkle_mismatch() {
        let (_, keys, chain) = setup();
        let mut bundle = chain[2].clone();
        bundle.transactions[1] = Transaction::new("intruder", "x", "y", 5, 0);

        assert!(matches!(
            validate_block(&bundle, Some(&chain[1].block.tip()), &keys),
            Err(ValidationError::MerkleMismatch { height: 2, .. })
        ));
    }

    #[test]
    fn test_tampered_transaction_detected() {
        let (_, keys, chain) = setup();
        let mut bundle = chain[1].clone();
        bundle.transactions[0].amount += 1;
        assert!(matches!(
            validate_block(&bundle, Some(&chain[0].block.tip()), &keys),
            Err(ValidationError::TransactionHashMismatch { height: 1, .. })
        ));

        let mut bundle = chain[1].clone();
        bundle.transactions.pop();
        assert!(matches!(
            validate_block(&bundle, Some(&chain[0].block.tip()), &keys),
            Err(ValidationError::TxCountMismatch { declared: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_tampered_header_and_signature() {
        let (authority, keys, chain) = setup();
        let parent = chain[0].block.tip();

        let mut bundle = chain[1].clone();
        bundle.block.timestamp_ms += 1;
        assert!(matches!(
            validate_block(&bundle, Some(&parent), &keys),
            Err(ValidationError::HashMismatch { .. })
        ));

        // Correctly sealed by a key the directory does not know.
        let impostor = keypair("authority", 9);
        let txs = make_transactions(1, 1);
        let forged = BlockBundle::new(Block::seal(1, parent.hash, 5, &impostor, &txs), txs);
        assert!(matches!(
            validate_block(&forged, Some(&parent), &keys),
            Err(ValidationError::BadSignature { height: 1, .. })
        ));

        let txs = make_transactions(1, 1);
        let genuine = BlockBundle::new(Block::seal(1, parent.hash, 5, &authority, &txs), txs);
        validate_block(&genuine, Some(&parent), &keys).unwrap();
    }

    #[test]
    fn test_validate_chain_reports_bad_heights() {
        let (_, keys, chain) = setup();
        let store = MemoryLedgerStore::new();
        for bundle in &chain[..2] {
            write_bundle(&store, bundle).unwrap();
        }
        assert!(validate_chain(&store, &keys).unwrap().is_empty());

        // Height 2 stored with an edited header. Height 3 still links to
        // the hash height 2 claims, so only height 2 is flagged.
        let mut bad = chain[2].clone();
        bad.block.timestamp_ms += 7;
        write_bundle(&store, &bad).unwrap();
        write_bundle(&store, &chain[3]).unwrap();

        let invalid = validate_chain(&store, &keys).unwrap();
        assert_eq!(invalid, vec![2]);
    }

    #[test]
    fn test_validate_empty_store() {
        let (_, keys, _) = setup();
        assert!(validate_chain(&MemoryLedgerStore::new(), &keys)
            .unwrap()
            .is_empty());
    }
}
