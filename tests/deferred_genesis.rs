//! A shard with a genesis root height greater than zero stays dormant until
//! the cluster's root chain reaches that height.

use mondoshawan_cluster::cluster::{spawn_slave, Master, Slave};
use mondoshawan_cluster::config::{ClusterConfig, ConsensusType, GenesisConfig, PowConfig, RootConfig, ShardConfig};
use mondoshawan_cluster::types::Address;

fn two_chain_config() -> ClusterConfig {
    let root = RootConfig {
        consensus_type: ConsensusType::None,
        pow_config: None,
        target_block_time_sec: 60,
        coinbase_address: Address::new([0u8; 20], 0),
        max_stale_root_block_height_diff: 60,
    };
    let shard = |chain_id: u16, genesis_root_height: u64| ShardConfig {
        chain_id,
        shard_size: 1,
        shard_id: 0,
        consensus_type: ConsensusType::None,
        pow_config: None::<PowConfig>,
        coinbase_address: Address::new([chain_id as u8; 20], 0),
        genesis: GenesisConfig {
            root_height: genesis_root_height,
            ..GenesisConfig::default()
        },
        target_block_time_sec: 10,
        max_tx_pool_size: 100,
    };
    ClusterConfig {
        network_id: 1,
        version: 1,
        p2p_port: 0,
        json_rpc_port: 0,
        metrics_port: 0,
        bootstrap_peers: Vec::new(),
        root,
        shards: vec![shard(0, 1), shard(1, 2)],
    }
}

#[tokio::test]
async fn shards_come_online_at_their_configured_genesis_root_height() {
    let config = two_chain_config();
    let chain0 = config.shards[0].full_shard_id();
    let chain1 = config.shards[1].full_shard_id();

    let mut master = Master::new(config.clone());
    for shard_cfg in &config.shards {
        let fsid = shard_cfg.full_shard_id();
        master.register_slave(spawn_slave(Slave::new(format!("slave-{fsid}"), &[fsid], &config, None)));
    }

    master.run_genesis_orchestration().await.unwrap();
    assert!(!master.get_shard_status(chain0).await.unwrap().has_genesis);
    assert!(!master.get_shard_status(chain1).await.unwrap().has_genesis);

    let coinbase = Address::new([9u8; 20], 0);

    // Root height 1: only chain 0's genesis threshold is reached.
    let root1 = master.root.create_block_to_mine(coinbase, &config.shards, 1).unwrap();
    assert!(root1.minor_block_headers.is_empty());
    master.add_root_block(root1).await.unwrap();
    assert!(master.get_shard_status(chain0).await.unwrap().has_genesis);
    assert!(!master.get_shard_status(chain1).await.unwrap().has_genesis);

    // The next mined root block carries exactly chain 0's genesis header,
    // queued by `create_due_shard_genesis` when it came online.
    let root2 = master.root.create_block_to_mine(coinbase, &config.shards, 2).unwrap();
    assert_eq!(root2.minor_block_headers.len(), 1);
    assert_eq!(root2.minor_block_headers[0].branch, chain0);

    // Root height 2: chain 1 comes online too.
    master.add_root_block(root2).await.unwrap();
    assert!(master.get_shard_status(chain0).await.unwrap().has_genesis);
    assert!(master.get_shard_status(chain1).await.unwrap().has_genesis);
}
