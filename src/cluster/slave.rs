//! A Slave owns a disjoint subset of shards (its shard mask) and answers
//! RPCs issued by the Master: `add_tx`, `add_minor_block`, `get_account_data`,
//! `add_root_block`, `handle_xshard_tx_list`.

use crate::block::{CrossShardTxList, MinorBlock, RootBlockHeader, Transaction};
use crate::config::ClusterConfig;
use crate::consensus::engine_for;
use crate::core::ShardState;
use crate::error::{ClusterError, ClusterResult};
use crate::evm::SimpleExecutionEngine;
use crate::storage::{Database, MinorBlockStore};
use crate::types::{Address, FullShardId, Hash};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub struct ShardStatus {
    pub branch: FullShardId,
    pub tip_height: u64,
    pub tip_hash: Option<Hash>,
    pub mempool_size: usize,
    pub has_genesis: bool,
}

pub enum SlaveCommand {
    CreateGenesis {
        branch: FullShardId,
        root_genesis_hash: Hash,
        timestamp: u64,
    },
    AddTx {
        branch: FullShardId,
        tx: Transaction,
    },
    AddMinorBlock {
        branch: FullShardId,
        block: MinorBlock,
    },
    CreateBlockToMine {
        branch: FullShardId,
        coinbase: Address,
    },
    GetAccountData {
        branch: FullShardId,
        address: Address,
    },
    AddRootBlock {
        header: RootBlockHeader,
        confirmed: HashMap<FullShardId, Vec<Hash>>,
    },
    HandleXShardTxList {
        branch: FullShardId,
        list: CrossShardTxList,
    },
    GetShardStatus {
        branch: FullShardId,
    },
    ListShardStatuses,
    GetMinorBlocksByHash {
        branch: FullShardId,
        hashes: Vec<Hash>,
    },
}

pub enum SlaveReply {
    Ok,
    GenesisBlock(MinorBlock),
    MinorBlockMined(MinorBlock),
    MinorBlockAdded(HashMap<FullShardId, CrossShardTxList>),
    AccountData { balance: u128, nonce: u64 },
    ShardStatus(ShardStatus),
    ShardStatuses(Vec<ShardStatus>),
    MinorBlocks(Vec<MinorBlock>),
}

/// Hosts every `ShardState` this slave owns and dispatches the tagged
/// command variants above to the matching shard.
pub struct Slave {
    pub id: String,
    shards: HashMap<FullShardId, ShardState>,
    /// Present iff the cluster is configured with a `data_dir`; absent, the
    /// slave runs fully in-memory (as every existing test does).
    stores: HashMap<FullShardId, MinorBlockStore>,
}

impl Slave {
    pub fn new(id: String, owned: &[FullShardId], cluster_config: &ClusterConfig, db: Option<Arc<Database>>) -> Self {
        let mut shards = HashMap::new();
        let mut stores = HashMap::new();
        for fsid in owned {
            if let Some(shard_cfg) = cluster_config.shard_config(*fsid) {
                let consensus = engine_for(shard_cfg.consensus_type, shard_cfg.pow_config.clone());
                let state = ShardState::new(shard_cfg.clone(), consensus, Box::new(SimpleExecutionEngine));
                shards.insert(*fsid, state);
                if let Some(db) = &db {
                    match MinorBlockStore::new(db, *fsid) {
                        Ok(store) => {
                            stores.insert(*fsid, store);
                        }
                        Err(e) => tracing::warn!(shard = %fsid, error = %e, "failed to open shard store, running in-memory"),
                    }
                }
            }
        }
        Self { id, shards, stores }
    }

    /// Persists `block` and the account balances it touched, if this shard
    /// has a backing store. Best-effort: a storage write failure is logged,
    /// not propagated, since the in-memory state is already authoritative
    /// for this process's lifetime.
    fn persist_block(&self, branch: FullShardId, block: &MinorBlock, shard: &ShardState) {
        let Some(store) = self.stores.get(&branch) else { return };
        if let Err(e) = store.put_block(block) {
            tracing::warn!(shard = %branch, error = %e, "failed to persist minor block");
            return;
        }
        for tx in &block.transactions {
            let balance = shard.get_balance(&tx.from);
            if let Err(e) = store.put_account_balance(&tx.from, balance) {
                tracing::warn!(shard = %branch, error = %e, "failed to persist account balance");
            }
        }
    }

    pub fn owned_shards(&self) -> Vec<FullShardId> {
        self.shards.keys().copied().collect()
    }

    fn shard_mut(&mut self, branch: &FullShardId) -> ClusterResult<&mut ShardState> {
        self.shards
            .get_mut(branch)
            .ok_or_else(|| ClusterError::InvalidBlock(format!("slave does not own shard {branch}")))
    }

    pub fn handle(&mut self, cmd: SlaveCommand) -> ClusterResult<SlaveReply> {
        match cmd {
            SlaveCommand::CreateGenesis {
                branch,
                root_genesis_hash,
                timestamp,
            } => {
                let shard = self.shard_mut(&branch)?;
                let block = shard.create_genesis(root_genesis_hash, timestamp)?;
                self.persist_block(branch, &block, self.shards.get(&branch).unwrap());
                Ok(SlaveReply::GenesisBlock(block))
            }
            SlaveCommand::AddTx { branch, tx } => {
                let shard = self.shard_mut(&branch)?;
                shard.add_transaction(tx)?;
                Ok(SlaveReply::Ok)
            }
            SlaveCommand::AddMinorBlock { branch, block } => {
                let shard = self.shard_mut(&branch)?;
                let fan_out = shard.add_block(block.clone())?;
                self.persist_block(branch, &block, self.shards.get(&branch).unwrap());
                Ok(SlaveReply::MinorBlockAdded(fan_out))
            }
            SlaveCommand::CreateBlockToMine { branch, coinbase } => {
                let shard = self.shard_mut(&branch)?;
                let block = shard.create_block_to_mine(coinbase)?;
                Ok(SlaveReply::MinorBlockMined(block))
            }
            SlaveCommand::GetAccountData { branch, address } => {
                let shard = self.shard_mut(&branch)?;
                Ok(SlaveReply::AccountData {
                    balance: shard.get_balance(&address),
                    nonce: shard.get_nonce(&address),
                })
            }
            SlaveCommand::AddRootBlock { header, confirmed } => {
                for (branch, shard) in self.shards.iter_mut() {
                    let confirmed_hashes = confirmed.get(branch).cloned().unwrap_or_default();
                    shard.add_root_block(header.clone(), &confirmed_hashes)?;
                }
                Ok(SlaveReply::Ok)
            }
            SlaveCommand::HandleXShardTxList { branch, list } => {
                let shard = self.shard_mut(&branch)?;
                shard.handle_xshard_tx_list(list);
                Ok(SlaveReply::Ok)
            }
            SlaveCommand::GetShardStatus { branch } => {
                let shard = self.shard_mut(&branch)?;
                Ok(SlaveReply::ShardStatus(ShardStatus {
                    branch,
                    tip_height: shard.tip_height(),
                    tip_hash: shard.tip_hash(),
                    mempool_size: shard.mempool_len(),
                    has_genesis: shard.has_genesis(),
                }))
            }
            SlaveCommand::ListShardStatuses => {
                let statuses = self
                    .shards
                    .iter()
                    .map(|(branch, shard)| ShardStatus {
                        branch: *branch,
                        tip_height: shard.tip_height(),
                        tip_hash: shard.tip_hash(),
                        mempool_size: shard.mempool_len(),
                        has_genesis: shard.has_genesis(),
                    })
                    .collect();
                Ok(SlaveReply::ShardStatuses(statuses))
            }
            SlaveCommand::GetMinorBlocksByHash { branch, hashes } => {
                let shard = self.shard_mut(&branch)?;
                let blocks = hashes.iter().filter_map(|h| shard.get_block_by_hash(h).cloned()).collect();
                Ok(SlaveReply::MinorBlocks(blocks))
            }
        }
    }
}

/// The Master's in-process handle to a Slave running as its own task. Models
/// "RPC over a local transport" (spec's concurrency model) as an mpsc
/// request channel carrying a oneshot reply, with a timeout standing in for
/// the wire RPC deadline.
#[derive(Clone)]
pub struct SlaveHandle {
    pub id: String,
    pub owned: Vec<FullShardId>,
    sender: mpsc::Sender<(SlaveCommand, oneshot::Sender<ClusterResult<SlaveReply>>)>,
}

impl SlaveHandle {
    pub async fn call(&self, cmd: SlaveCommand, timeout: std::time::Duration) -> ClusterResult<SlaveReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send((cmd, reply_tx))
            .await
            .map_err(|_| ClusterError::PeerClosed(format!("slave {} channel closed", self.id)))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::PeerClosed(format!("slave {} dropped reply", self.id))),
            Err(_) => Err(ClusterError::RpcTimeout(format!("slave {} rpc timed out", self.id))),
        }
    }
}

/// Spawns `slave` as its own task (one task per Slave, per the concurrency
/// model) and returns the handle the Master uses to reach it.
pub fn spawn_slave(mut slave: Slave) -> SlaveHandle {
    let id = slave.id.clone();
    let owned = slave.owned_shards();
    let (tx, mut rx) = mpsc::channel::<(SlaveCommand, oneshot::Sender<ClusterResult<SlaveReply>>)>(256);
    tokio::spawn(async move {
        while let Some((cmd, reply)) = rx.recv().await {
            let result = slave.handle(cmd);
            let _ = reply.send(result);
        }
    });
    SlaveHandle { id, owned, sender: tx }
}
