//! Signed block fixtures.

use consortium_storage::test_helpers::make_transactions;
use consortium_types::{Block, BlockBundle, ChainTip, NodeKeypair};

pub use consortium_storage::test_helpers::{keypair, make_chain, write_bundle};

/// The block following `tip`, signed by `signer` and carrying `tx_count`
/// transactions. With no tip this is the genesis block.
pub fn next_bundle(signer: &NodeKeypair, tip: Option<ChainTip>, tx_count: usize) -> BlockBundle {
    match tip {
        None => BlockBundle::new(Block::genesis(signer, 0), Vec::new()),
        Some(tip) => {
            let height = tip.height + 1;
            let transactions = make_transactions(height, tx_count);
            let block = Block::seal(height, tip.hash, height * 1_000, signer, &transactions);
            BlockBundle::new(block, transactions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_bundle_links_to_tip() {
        let authority = keypair("authority", 1);
        let genesis = next_bundle(&authority, None, 5);
        assert!(genesis.block.is_genesis());
        assert!(genesis.transactions.is_empty());

        let next = next_bundle(&authority, Some(genesis.block.tip()), 3);
        assert_eq!(next.height(), 1);
        assert_eq!(next.block.previous_hash, genesis.block.hash);
        assert_eq!(next.transactions.len(), 3);
    }
}
