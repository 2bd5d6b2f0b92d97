//! Shared test helpers for storage crate tests.
//!
//! Fixture builders plus a conformance suite so that storage-memory and
//! storage-rocksdb are checked against a single source of truth. Each
//! `check_*` function expects a fresh, empty store.

use crate::{BlockId, ConsensusMeta, LedgerStore, NodeFilter, StorageError};
use consortium_types::{
    Block, BlockBundle, ConsensusEvent, EventKind, Hash, NodeId, NodeKeypair, NodeRecord,
    NodeStatus, Role, Transaction,
};

/// Deterministic key pair for `name`.
pub fn keypair(name: &str, seed: u8) -> NodeKeypair {
    NodeKeypair::from_seed(NodeId::from(name), [seed; 32])
}

/// `count` distinct transactions for the block at `height`.
pub fn make_transactions(height: u64, count: usize) -> Vec<Transaction> {
    (0..count)
        .map(|i| {
            Transaction::new(
                format!("tx-{height}-{i}"),
                format!("sender-{i}"),
                format!("receiver-{i}"),
                100 + i as u64,
                height * 1_000 + i as u64,
            )
        })
        .collect()
}

/// A valid chain of `len` bundles starting at genesis, each non-genesis
/// block carrying `txs_per_block` transactions.
pub fn make_chain(keypair: &NodeKeypair, len: u64, txs_per_block: usize) -> Vec<BlockBundle> {
    let mut chain = Vec::with_capacity(len as usize);
    if len == 0 {
        return chain;
    }
    let genesis = Block::genesis(keypair, 0);
    let mut previous = genesis.hash;
    chain.push(BlockBundle::new(genesis, Vec::new()));

    for height in 1..len {
        let txs = make_transactions(height, txs_per_block);
        let block = Block::seal(height, previous, height * 1_000, keypair, &txs);
        previous = block.hash;
        chain.push(BlockBundle::new(block, txs));
    }
    chain
}

/// Write a bundle with the three-step insert inside one atomic transaction.
pub fn write_bundle(store: &dyn LedgerStore, bundle: &BlockBundle) -> Result<BlockId, StorageError> {
    let mut block_id = None;
    store.write_atomically(&mut |writer| {
        let id = writer.insert_block_if_absent(&bundle.block)?;
        for tx in &bundle.transactions {
            writer.insert_transaction_if_absent(tx)?;
        }
        for tx in &bundle.transactions {
            writer.insert_block_transaction_link(id, &tx.id)?;
        }
        block_id = Some(id);
        Ok(())
    })?;
    block_id.ok_or_else(|| StorageError::Backend("write produced no block id".into()))
}

// ═══════════════════════════════════════════════════════════════════════
// Conformance checks
// ═══════════════════════════════════════════════════════════════════════

/// Blocks and their transactions read back exactly as written, in link order.
pub fn check_block_roundtrip(store: &dyn LedgerStore) {
    let chain = make_chain(&keypair("authority", 1), 3, 4);
    assert!(store.get_last_block().unwrap().is_none());

    for bundle in &chain {
        write_bundle(store, bundle).unwrap();
    }

    let last = store.get_last_block().unwrap().unwrap();
    assert_eq!(last.block, chain[2].block);
    assert_eq!(store.tip().unwrap(), Some(chain[2].block.tip()));

    for bundle in &chain {
        let read = store.get_bundle_at_height(bundle.height()).unwrap().unwrap();
        assert_eq!(&read, bundle);
    }
    assert!(store.get_block_at_height(3).unwrap().is_none());

    let tx = &chain[1].transactions[0];
    assert_eq!(store.get_transaction(&tx.id).unwrap().as_ref(), Some(tx));
}

/// Writing the same bundle twice returns the same block id and changes nothing.
pub fn check_idempotent_insert(store: &dyn LedgerStore) {
    let chain = make_chain(&keypair("authority", 1), 2, 3);
    write_bundle(store, &chain[0]).unwrap();

    let first = write_bundle(store, &chain[1]).unwrap();
    let before = store.get_bundle_at_height(1).unwrap();
    let second = write_bundle(store, &chain[1]).unwrap();

    assert_eq!(first, second);
    assert_eq!(store.get_bundle_at_height(1).unwrap(), before);
    assert_eq!(store.get_transactions_for_block(first).unwrap().len(), 3);
}

/// A failing atomic write leaves no trace of any of its steps.
pub fn check_atomic_rollback(store: &dyn LedgerStore) {
    let chain = make_chain(&keypair("authority", 1), 2, 2);
    write_bundle(store, &chain[0]).unwrap();

    let bundle = &chain[1];
    let result = store.write_atomically(&mut |writer| {
        let id = writer.insert_block_if_absent(&bundle.block)?;
        writer.insert_transaction_if_absent(&bundle.transactions[0])?;
        writer.insert_block_transaction_link(id, &bundle.transactions[0].id)?;
        Err(StorageError::Backend("injected".into()))
    });

    assert!(result.is_err());
    assert!(store.get_block_at_height(1).unwrap().is_none());
    assert!(store
        .get_transaction(&bundle.transactions[0].id)
        .unwrap()
        .is_none());
    assert_eq!(store.tip().unwrap(), Some(chain[0].block.tip()));
}

/// A different block at an occupied height is refused.
pub fn check_conflicting_block_rejected(store: &dyn LedgerStore) {
    let ours = make_chain(&keypair("authority", 1), 2, 1);
    let theirs = make_chain(&keypair("authority", 1), 2, 2);
    write_bundle(store, &ours[0]).unwrap();
    write_bundle(store, &ours[1]).unwrap();

    let err = write_bundle(store, &theirs[1]).unwrap_err();
    assert!(matches!(err, StorageError::Conflict { height: 1, .. }));
    assert_eq!(store.get_block_at_height(1).unwrap().unwrap().block, ours[1].block);
}

/// Links must point at existing rows.
pub fn check_dangling_link_rejected(store: &dyn LedgerStore) {
    let chain = make_chain(&keypair("authority", 1), 1, 0);
    let id = write_bundle(store, &chain[0]).unwrap();

    let result = store.write_atomically(&mut |writer| {
        writer.insert_block_transaction_link(id, "missing-tx")
    });
    assert!(matches!(result, Err(StorageError::DanglingLink { .. })));
}

/// Re-inserting a stored transaction and its link is a no-op.
pub fn check_relink_is_noop(store: &dyn LedgerStore) {
    let authority = keypair("authority", 1);
    let genesis = Block::genesis(&authority, 0);
    let shared = make_transactions(1, 1);
    let block = Block::seal(1, genesis.hash, 1_000, &authority, &shared);
    write_bundle(store, &BlockBundle::new(genesis, Vec::new())).unwrap();
    let id = write_bundle(store, &BlockBundle::new(block, shared.clone())).unwrap();

    store
        .write_atomically(&mut |writer| {
            writer.insert_transaction_if_absent(&shared[0])?;
            writer.insert_block_transaction_link(id, &shared[0].id)
        })
        .unwrap();

    assert_eq!(store.get_transactions_for_block(id).unwrap(), shared);
}

/// Node directory upserts, filters and state updates.
pub fn check_node_directory(store: &dyn LedgerStore) {
    let authority = NodeRecord::new(NodeId::from("authority"), Role::Authority, 10);
    let member = NodeRecord::new(NodeId::from("member-1"), Role::Member, 10);
    store.upsert_node(&authority).unwrap();
    store.upsert_node(&member).unwrap();

    let members = store.list_nodes(&NodeFilter::role(Role::Member)).unwrap();
    assert_eq!(members, vec![member.clone()]);

    let hash = Hash::from_bytes(b"tip");
    store.update_node_state(&member.id, 7, hash, 99).unwrap();
    // Unknown ids are ignored.
    store
        .update_node_state(&NodeId::from("ghost"), 1, hash, 99)
        .unwrap();

    let all = store.list_nodes(&NodeFilter::all()).unwrap();
    assert_eq!(all.len(), 2);
    let updated = all.iter().find(|n| n.id == member.id).unwrap();
    assert_eq!(updated.reported_height, Some(7));
    assert_eq!(updated.last_block_hash, Some(hash));
    assert_eq!(updated.last_seen_ms, 99);
    assert_eq!(updated.role, Role::Member);

    let mut unreachable = updated.clone();
    unreachable.status = NodeStatus::Unreachable;
    store.upsert_node(&unreachable).unwrap();
    let active = store
        .list_nodes(&NodeFilter::all().with_status(NodeStatus::Active))
        .unwrap();
    assert_eq!(active, vec![authority]);
}

/// Event log ordering and consensus metadata persistence.
pub fn check_events_and_meta(store: &dyn LedgerStore) {
    let node = NodeId::from("member-1");
    for term in 1..=5 {
        let event = ConsensusEvent::new(EventKind::ElectionStart, node.clone(), term).at(term);
        store.record_event(&event).unwrap();
    }
    let recent = store.recent_events(2).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].term, 4);
    assert_eq!(recent[1].term, 5);

    assert_eq!(store.load_consensus_meta().unwrap(), None);
    let meta = ConsensusMeta {
        current_term: 6,
        last_known_cluster_term: 9,
    };
    store.save_consensus_meta(&meta).unwrap();
    assert_eq!(store.load_consensus_meta().unwrap(), Some(meta));
}
