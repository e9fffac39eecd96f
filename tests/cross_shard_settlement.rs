//! A cross-shard transfer debits the source shard immediately but only
//! credits the destination after the source's containing root block is
//! confirmed on the canonical root chain.

use mondoshawan_cluster::block::{MinorBlock, Transaction};
use mondoshawan_cluster::config::{
    ConsensusType, GenesisConfig, RootConfig, ShardConfig, GTXCOST, GTXXSHARDCOST,
};
use mondoshawan_cluster::consensus::NoneEngine;
use mondoshawan_cluster::core::{RootState, ShardState};
use mondoshawan_cluster::evm::SimpleExecutionEngine;
use mondoshawan_cluster::types::Address;

fn shard_cfg(shard_id: u16) -> ShardConfig {
    ShardConfig {
        chain_id: 0,
        shard_size: 2,
        shard_id,
        consensus_type: ConsensusType::None,
        pow_config: None,
        coinbase_address: Address::new([0xffu8; 20], 0),
        genesis: GenesisConfig::default(),
        target_block_time_sec: 10,
        max_tx_pool_size: 100,
    }
}

fn new_shard(shard_id: u16) -> ShardState {
    ShardState::new(shard_cfg(shard_id), Box::new(NoneEngine), Box::new(SimpleExecutionEngine))
}

#[tokio::test]
async fn cross_shard_deposit_settles_only_after_root_confirmation() {
    let mut root = RootState::new(
        RootConfig {
            consensus_type: ConsensusType::None,
            pow_config: None,
            target_block_time_sec: 60,
            coinbase_address: Address::new([0u8; 20], 0),
            max_stale_root_block_height_diff: 60,
        },
        Box::new(NoneEngine),
    );
    let root_genesis = root.create_genesis(0);
    let root_genesis_hash = root_genesis.hash();

    let mut shard0 = new_shard(0); // branch raw low bits 0b10
    let mut shard1 = new_shard(1); // branch raw low bits 0b11, neighbor of shard0

    // acc1's full_shard_key must match shard0's own full_shard_id so it
    // resolves to the same account `create_genesis` seeds from `alloc`.
    let acc1 = Address::new([1u8; 20], shard0.full_shard_id().raw());
    let acc3 = Address::new([3u8; 20], 1);

    shard0
        .config
        .genesis
        .alloc
        .insert(hex::encode(acc1.recipient), 1_000_000);
    shard0.create_genesis(root_genesis_hash, 0).unwrap();
    shard1.create_genesis(root_genesis_hash, 0).unwrap();

    let gas = GTXXSHARDCOST + GTXCOST;
    let tx = Transaction::unsigned(acc1, acc3, 54_321, gas, 0, 3).sign(&[7u8; 32]);
    shard0.add_transaction(tx.clone()).unwrap();

    let candidate = shard0.create_block_to_mine(Address::new([9u8; 20], 0)).unwrap();
    let fan_out = shard0.add_block(candidate.clone()).unwrap();

    // acc1 pays value + gas*price on the source side immediately.
    assert_eq!(
        shard0.get_balance(&acc1),
        1_000_000 - 54_321 - gas as u128 * 3
    );

    let shard1_fsid = shard1.full_shard_id();
    let list = fan_out.get(&shard1_fsid).cloned().expect("shard1 is shard0's neighbor");
    assert_eq!(list.deposits.len(), 1);
    assert_eq!(list.deposits[0].value, 54_321);

    shard1.handle_xshard_tx_list(list);
    // Not credited yet: the source block hasn't been confirmed by a root block.
    assert_eq!(shard1.get_balance(&acc3), 0);

    // Mine and confirm a root block that contains shard0's new header.
    root.add_pending_minor_header(candidate.header.clone());
    let root_block = root
        .create_block_to_mine(Address::new([0u8; 20], 0), &[shard_cfg(0), shard_cfg(1)], 1)
        .unwrap();
    root.add_block(root_block.clone()).unwrap();
    let confirmed = root.confirmed_minor_hashes(&root_block.hash(), shard0.full_shard_id());
    assert_eq!(confirmed, vec![candidate.hash()]);

    shard1.add_root_block(root_block.header.clone(), &confirmed).unwrap();
    // Ready, but still not applied to account state until shard1's next block.
    assert_eq!(shard1.get_balance(&acc3), 0);

    let shard1_block = shard1.create_block_to_mine(Address::new([8u8; 20], 1)).unwrap();
    let empty_fan_out = shard1.add_block(shard1_block).unwrap();
    assert!(empty_fan_out.is_empty());

    assert_eq!(shard1.get_balance(&acc3), 54_321);
}

#[tokio::test]
async fn double_add_block_is_idempotent_after_cross_shard_deposit() {
    let mut shard0 = new_shard(0);
    shard0.create_genesis([0xAAu8; 32], 0).unwrap();
    let block: MinorBlock = shard0.create_block_to_mine(Address::new([9u8; 20], 0)).unwrap();
    shard0.add_block(block.clone()).unwrap();
    let tip = shard0.tip_hash();
    let fan_out_again = shard0.add_block(block).unwrap();
    assert!(fan_out_again.is_empty());
    assert_eq!(shard0.tip_hash(), tip);
}
