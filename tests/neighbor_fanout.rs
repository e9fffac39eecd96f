//! A cross-shard transaction's outputs reach exactly the destination's
//! neighbor shards and no others.

use mondoshawan_cluster::block::Transaction;
use mondoshawan_cluster::config::{ConsensusType, GenesisConfig, ShardConfig};
use mondoshawan_cluster::consensus::NoneEngine;
use mondoshawan_cluster::core::ShardState;
use mondoshawan_cluster::evm::SimpleExecutionEngine;
use mondoshawan_cluster::types::{Address, FullShardId};

fn shard_64(shard_id: u16) -> ShardState {
    let cfg = ShardConfig {
        chain_id: 0,
        shard_size: 64,
        shard_id,
        consensus_type: ConsensusType::None,
        pow_config: None,
        coinbase_address: Address::new([0u8; 20], 0),
        genesis: GenesisConfig::default(),
        target_block_time_sec: 10,
        max_tx_pool_size: 1000,
    };
    ShardState::new(cfg, Box::new(NoneEngine), Box::new(SimpleExecutionEngine))
}

#[tokio::test]
async fn cross_shard_tx_fans_out_to_neighbors_only() {
    let mut source = shard_64(0);
    // sender's full_shard_key must match source's own full_shard_id so it
    // resolves to the same account `create_genesis` seeds from `alloc`.
    let sender = Address::new([1u8; 20], source.full_shard_id().raw());
    source
        .config
        .genesis
        .alloc
        .insert(hex::encode(sender.recipient), 10_000_000);
    source.create_genesis([0x11u8; 32], 0).unwrap();

    // One block per possible destination shard id in 1..64, mined one at a
    // time so each transaction's nonce is unambiguous.
    let mut reached: std::collections::HashSet<u16> = std::collections::HashSet::new();
    for (nonce, shard_id) in (1u16..64).enumerate() {
        let recipient = Address::new([shard_id as u8; 20], shard_id as u32);
        let tx = Transaction::unsigned(
            sender,
            recipient,
            1,
            mondoshawan_cluster::config::GTXXSHARDCOST + mondoshawan_cluster::config::GTXCOST,
            nonce as u64,
            1,
        )
        .sign(&[7u8; 32]);
        source.add_transaction(tx).unwrap();
        let block = source.create_block_to_mine(Address::new([9u8; 20], 0)).unwrap();
        assert_eq!(block.transactions.len(), 1);
        let fan_out = source.add_block(block).unwrap();
        for fsid in fan_out.keys() {
            assert!(FullShardId::new(0, 64, 0).is_neighbor_of(fsid));
            reached.insert(fsid.shard_id());
        }
    }

    let mut got: Vec<u16> = reached.into_iter().collect();
    got.sort_unstable();
    assert_eq!(got, vec![1, 2, 4, 8, 16, 32]);
}
