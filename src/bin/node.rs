//! Cluster node entrypoint: loads a `ClusterConfig`, brings up a `Master`
//! with one `Slave` task per configured shard, starts the cluster peer
//! listener and the JSON-RPC Node API, then waits for shutdown.
//!
//! Usage: node [config.json|config.toml]

use mondoshawan_cluster::cluster::{spawn_slave, Master, Slave};
use mondoshawan_cluster::config::ClusterConfig;
use mondoshawan_cluster::metrics::create_metrics;
use mondoshawan_cluster::network::{random_peer_id, ClusterPeerManager, NetworkEvent};
use mondoshawan_cluster::rpc::{serve, RpcServer};
use mondoshawan_cluster::storage::Database;
use mondoshawan_cluster::synchronizer::PeerSynchronizer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => ClusterConfig::from_file(path)?,
        None => {
            let cfg = ClusterConfig::default();
            cfg.init_and_validate()?;
            cfg
        }
    };

    tracing::info!(
        network_id = config.network_id,
        shard_count = config.shards.len(),
        "starting cluster node"
    );

    let db = match &config.data_dir {
        Some(dir) => {
            let db = Database::open(dir)?;
            tracing::info!(dir, "opened persistent storage");
            Some(Arc::new(db))
        }
        None => {
            tracing::info!("no data_dir configured, running fully in-memory");
            None
        }
    };

    let mut master = match &db {
        Some(db) => Master::with_storage(config.clone(), db)?,
        None => Master::new(config.clone()),
    };

    // One Slave task per configured shard in this single-process topology;
    // a multi-process deployment would instead group shards per Slave and
    // connect the Master to them over the wire protocol in `network`.
    for shard_cfg in &config.shards {
        let fsid = shard_cfg.full_shard_id();
        let slave = Slave::new(format!("slave-{fsid}"), &[fsid], &config, db.clone());
        master.register_slave(spawn_slave(slave));
    }

    master.run_genesis_orchestration().await?;

    let master = Arc::new(Mutex::new(master));

    let metrics = create_metrics().map_err(|e| format!("failed to init metrics registry: {e}"))?;

    let mut rpc_server = RpcServer::new(master.clone());
    rpc_server.set_metrics(metrics.clone());
    let rpc_server = Arc::new(rpc_server);

    let rpc_addr: SocketAddr = format!("127.0.0.1:{}", config.json_rpc_port).parse()?;
    tokio::spawn(async move {
        if let Err(e) = serve(rpc_addr, rpc_server).await {
            tracing::error!(error = %e, "json-rpc server exited");
        }
    });

    let (event_tx, mut event_rx) = mpsc::channel::<NetworkEvent>(256);
    let peer_listen_addr: SocketAddr = format!("0.0.0.0:{}", config.p2p_port).parse()?;
    let peer_manager = Arc::new(ClusterPeerManager::new(
        random_peer_id(),
        config.network_id,
        config.version,
        peer_listen_addr,
        master.clone(),
        event_tx,
    ));
    peer_manager.clone().start().await?;

    for bootstrap in &config.bootstrap_peers {
        match bootstrap.parse::<SocketAddr>() {
            Ok(addr) => {
                let peer_manager = peer_manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = peer_manager.connect_peer(addr).await {
                        tracing::warn!(%addr, error = %e, "failed to connect bootstrap peer");
                    }
                });
            }
            Err(e) => tracing::warn!(bootstrap, error = %e, "invalid bootstrap peer address"),
        }
    }

    let master_for_events = master.clone();
    let peer_manager_for_events = peer_manager.clone();
    tokio::spawn(async move {
        let synchronizers: Mutex<HashMap<[u8; 32], PeerSynchronizer>> = Mutex::new(HashMap::new());
        while let Some(event) = event_rx.recv().await {
            match event {
                NetworkEvent::PeerConnected(id, addr) => {
                    tracing::info!(peer = %hex::encode(id), %addr, "peer connected");
                    synchronizers.lock().await.entry(id).or_insert_with(PeerSynchronizer::new);
                }
                NetworkEvent::PeerDisconnected(id) => {
                    tracing::info!(peer = %hex::encode(id), "peer disconnected");
                    synchronizers.lock().await.remove(&id);
                }
                NetworkEvent::NewTransactions(txs) => {
                    let mut master = master_for_events.lock().await;
                    for tx in txs {
                        if let Err(e) = master.add_transaction(tx).await {
                            e.abort_if_fatal();
                            tracing::debug!(error = %e, "rejected gossiped transaction");
                        }
                    }
                }
                NetworkEvent::NewMinorBlockHeaders(peer_id, headers) => {
                    let mut by_branch: HashMap<_, Vec<_>> = HashMap::new();
                    for header in &headers {
                        by_branch.entry(header.branch).or_default().push(header.hash());
                    }
                    for (branch, hashes) in by_branch {
                        let mut sync = synchronizers.lock().await;
                        let entry = sync.entry(peer_id).or_insert_with(PeerSynchronizer::new);
                        if !entry.start_pulling_shard(branch) {
                            continue;
                        }
                        drop(sync);

                        let pulled = peer_manager_for_events.request_minor_blocks(peer_id, branch, hashes).await;
                        let mut sync = synchronizers.lock().await;
                        let entry = sync.entry(peer_id).or_insert_with(PeerSynchronizer::new);
                        entry.begin_validating_shard(branch);
                        match pulled {
                            Ok(blocks) => {
                                drop(sync);
                                let mut master = master_for_events.lock().await;
                                let mut ok = true;
                                for block in blocks {
                                    if let Err(e) = master.add_minor_block(branch, block).await {
                                        e.abort_if_fatal();
                                        tracing::debug!(error = %e, "rejected synced minor block");
                                        ok = false;
                                    }
                                }
                                drop(master);
                                let mut sync = synchronizers.lock().await;
                                let entry = sync.entry(peer_id).or_insert_with(PeerSynchronizer::new);
                                if ok {
                                    entry.succeed_shard(branch);
                                } else {
                                    entry.fail_shard(branch);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(peer = %hex::encode(peer_id), error = %e, "failed to pull minor block bodies");
                                entry.fail_shard(branch);
                            }
                        }
                    }
                }
            }
        }
    });

    tracing::info!(
        rpc_port = config.json_rpc_port,
        p2p_port = config.p2p_port,
        "node is running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    Ok(())
}
