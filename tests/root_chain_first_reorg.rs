//! Root-chain-first tie-break: a shard's tip always re-anchors to whichever
//! minor-chain branch traces back to the canonical root tip, even if that
//! means abandoning a branch it had already extended.

use mondoshawan_cluster::block::{MinorBlock, MinorBlockHeader, RootBlock, RootBlockHeader, Transaction};
use mondoshawan_cluster::config::{ConsensusType, GenesisConfig, RootConfig, ShardConfig, GTXCOST};
use mondoshawan_cluster::consensus::NoneEngine;
use mondoshawan_cluster::core::{RootState, ShardState};
use mondoshawan_cluster::evm::SimpleExecutionEngine;
use mondoshawan_cluster::types::Address;

fn root_state() -> RootState {
    RootState::new(
        RootConfig {
            consensus_type: ConsensusType::None,
            pow_config: None,
            target_block_time_sec: 60,
            coinbase_address: Address::new([0u8; 20], 0),
            max_stale_root_block_height_diff: 60,
        },
        Box::new(NoneEngine),
    )
}

fn shard_state() -> ShardState {
    let cfg = ShardConfig {
        chain_id: 0,
        shard_size: 1,
        shard_id: 0,
        consensus_type: ConsensusType::None,
        pow_config: None,
        coinbase_address: Address::new([0u8; 20], 0),
        genesis: GenesisConfig::default(),
        target_block_time_sec: 10,
        max_tx_pool_size: 100,
    };
    ShardState::new(cfg, Box::new(NoneEngine), Box::new(SimpleExecutionEngine))
}

#[tokio::test]
async fn shard_tip_follows_root_reorg_not_which_branch_it_extended_first() {
    let mut root = root_state();
    let root_genesis = root.create_genesis(0);
    let root_genesis_hash = root_genesis.hash();

    let mut shard = shard_state();
    let genesis_minor = shard.create_genesis(root_genesis_hash, 0).unwrap();

    // root_a: the first child of the root genesis. Built normally, so it
    // becomes both root.tip and the shard's root anchor.
    let root_a = root
        .create_block_to_mine(Address::new([1u8; 20], 0), &[], 1)
        .unwrap();
    root.add_block(root_a.clone()).unwrap();
    shard.add_root_block(root_a.header.clone(), &[]).unwrap();

    // The shard mines its first real block on root_a's anchor.
    let minor_on_a = shard.create_block_to_mine(Address::new([3u8; 20], 0)).unwrap();
    assert_eq!(minor_on_a.header.hash_prev_root_block, root_a.hash());
    let fan_out_a = shard.add_block(minor_on_a.clone()).unwrap();
    assert!(fan_out_a.is_empty());
    assert_eq!(shard.tip_hash(), Some(minor_on_a.hash()));

    // root_b: a sibling of root_a, also a direct child of the root genesis,
    // with a different timestamp/coinbase so its hash differs.
    let root_b = RootBlock {
        header: RootBlockHeader {
            height: 1,
            hash_prev_root_block: root_genesis_hash,
            minor_header_merkle_root: RootBlock::minor_header_merkle_root(&[]),
            timestamp: 5,
            difficulty: 1,
            nonce: 0,
            coinbase_address: Address::new([2u8; 20], 0),
            coinbase_amount: 0,
        },
        minor_block_headers: Vec::new(),
    };
    root.add_block(root_b.clone()).unwrap();
    shard.add_root_block(root_b.header.clone(), &[]).unwrap();
    // root_a and root_b tie on cumulative difficulty; the shard must not
    // have switched its root anchor off root_a just because root_b arrived.
    assert_eq!(shard.tip_hash(), Some(minor_on_a.hash()));

    // A sibling minor block, anchored to root_b instead of root_a, built by
    // hand since `create_block_to_mine` always anchors to the shard's
    // *current* root tip.
    let minor_on_b = MinorBlock {
        header: MinorBlockHeader {
            branch: shard.full_shard_id(),
            height: 1,
            hash_prev_minor_block: genesis_minor.hash(),
            hash_prev_root_block: root_b.hash(),
            tx_merkle_root: MinorBlock::merkle_root(&[]),
            timestamp: 2,
            difficulty: 5,
            nonce: 0,
            coinbase_address: Address::new([7u8; 20], 0),
            coinbase_amount: 0,
        },
        transactions: Vec::new(),
    };
    let fan_out_b = shard.add_block(minor_on_b.clone()).unwrap();
    assert!(fan_out_b.is_empty());
    // Not yet canonical: root_b isn't an ancestor of the shard's root tip
    // (still root_a), so the shard's own tip hasn't moved.
    assert_eq!(shard.tip_hash(), Some(minor_on_a.hash()));

    // root_c: a child of root_b with overwhelming difficulty, so it becomes
    // the new canonical root tip ahead of root_a's branch.
    let root_c = RootBlock {
        header: RootBlockHeader {
            height: 2,
            hash_prev_root_block: root_b.hash(),
            minor_header_merkle_root: RootBlock::minor_header_merkle_root(&[]),
            timestamp: 6,
            difficulty: 10,
            nonce: 0,
            coinbase_address: Address::new([4u8; 20], 0),
            coinbase_amount: 0,
        },
        minor_block_headers: Vec::new(),
    };
    let reorg = root.add_block(root_c.clone()).unwrap();
    assert!(reorg.is_some());
    assert_eq!(root.tip_hash(), Some(root_c.hash()));

    shard.add_root_block(root_c.header.clone(), &[]).unwrap();

    // The shard's root anchor is now on the root_b branch, so root_a's
    // descendant is no longer admissible as the canonical tip: the shard
    // must re-anchor to minor_on_b, the block it built on the surviving
    // branch, even though minor_on_a was mined and committed first.
    assert_eq!(shard.tip_hash(), Some(minor_on_b.hash()));
    assert_ne!(shard.tip_hash(), Some(minor_on_a.hash()));
}

#[tokio::test]
async fn reorg_evicts_mempool_entries_orphaned_by_the_new_branch() {
    let mut root = root_state();
    let root_genesis = root.create_genesis(0);
    let root_genesis_hash = root_genesis.hash();

    let mut shard = shard_state();
    shard
        .config
        .genesis
        .alloc
        .insert(hex::encode([5u8; 20]), 1_000_000);
    let genesis_minor = shard.create_genesis(root_genesis_hash, 0).unwrap();

    // dave's full_shard_key must match the shard's own full_shard_id so it
    // resolves to the same account `create_genesis` seeded from `alloc`.
    let dave = Address::new([5u8; 20], shard.full_shard_id().raw());
    let key = [9u8; 32];

    let root_a = root
        .create_block_to_mine(Address::new([1u8; 20], 0), &[], 1)
        .unwrap();
    root.add_block(root_a.clone()).unwrap();
    shard.add_root_block(root_a.header.clone(), &[]).unwrap();

    // Dave's first transaction gets mined and committed on root_a's branch,
    // advancing his nonce to 1.
    let dave_tx0 = Transaction::unsigned(dave, Address::new([6u8; 20], 0), 10, GTXCOST, 0, 1).sign(&key);
    shard.add_transaction(dave_tx0).unwrap();
    let minor_on_a = shard.create_block_to_mine(Address::new([3u8; 20], 0)).unwrap();
    assert_eq!(minor_on_a.transactions.len(), 1);
    shard.add_block(minor_on_a.clone()).unwrap();
    assert_eq!(shard.mempool_len(), 0);

    // Dave queues a follow-up at nonce 1, unconfirmed.
    let dave_tx1 = Transaction::unsigned(dave, Address::new([6u8; 20], 0), 10, GTXCOST, 1, 1).sign(&key);
    shard.add_transaction(dave_tx1).unwrap();
    assert_eq!(shard.mempool_len(), 1);

    let root_b = RootBlock {
        header: RootBlockHeader {
            height: 1,
            hash_prev_root_block: root_genesis_hash,
            minor_header_merkle_root: RootBlock::minor_header_merkle_root(&[]),
            timestamp: 5,
            difficulty: 1,
            nonce: 0,
            coinbase_address: Address::new([2u8; 20], 0),
            coinbase_amount: 0,
        },
        minor_block_headers: Vec::new(),
    };
    root.add_block(root_b.clone()).unwrap();
    shard.add_root_block(root_b.header.clone(), &[]).unwrap();

    // A distinct transaction at the same nonce 1, committed on the sibling
    // branch (root_b). This only lands in minor_on_b's own account snapshot;
    // the shard tip (and its live account view) hasn't moved yet.
    let dave_tx1_alt = Transaction::unsigned(dave, Address::new([8u8; 20], 0), 10, GTXCOST, 1, 1).sign(&key);
    let minor_on_b = MinorBlock {
        header: MinorBlockHeader {
            branch: shard.full_shard_id(),
            height: 1,
            hash_prev_minor_block: genesis_minor.hash(),
            hash_prev_root_block: root_b.hash(),
            tx_merkle_root: MinorBlock::merkle_root(&[dave_tx1_alt.clone()]),
            timestamp: 2,
            difficulty: 5,
            nonce: 0,
            coinbase_address: Address::new([7u8; 20], 0),
            coinbase_amount: 0,
        },
        transactions: vec![dave_tx1_alt],
    };
    shard.add_block(minor_on_b.clone()).unwrap();
    assert_eq!(shard.tip_hash(), Some(minor_on_a.hash()));
    // Still queued: nothing has swept the mempool yet.
    assert_eq!(shard.mempool_len(), 1);

    let root_c = RootBlock {
        header: RootBlockHeader {
            height: 2,
            hash_prev_root_block: root_b.hash(),
            minor_header_merkle_root: RootBlock::minor_header_merkle_root(&[]),
            timestamp: 6,
            difficulty: 10,
            nonce: 0,
            coinbase_address: Address::new([4u8; 20], 0),
            coinbase_amount: 0,
        },
        minor_block_headers: Vec::new(),
    };
    root.add_block(root_c.clone()).unwrap();
    shard.add_root_block(root_c.header.clone(), &[]).unwrap();

    // The reorg re-anchors the tip to minor_on_b's branch; the stale nonce-1
    // entry left over from the abandoned branch must be swept at that point.
    assert_eq!(shard.tip_hash(), Some(minor_on_b.hash()));
    assert_eq!(shard.mempool_len(), 0);
}
