//! The single per-cluster orchestrator: holds the `RootState`, references
//! every `Slave`, and exposes the narrow Node API spec.md §4.4 names.

use crate::block::{CrossShardTxList, MinorBlock, RootBlock, Transaction};
use crate::cluster::slave::{ShardStatus, SlaveCommand, SlaveHandle, SlaveReply};
use crate::config::ClusterConfig;
use crate::consensus::engine_for;
use crate::core::RootState;
use crate::error::{ClusterError, ClusterResult};
use crate::storage::{Database, RootBlockStore};
use crate::types::{Address, FullShardId, Hash};
use std::sync::Arc;
use std::time::Duration;

pub enum MinedBlock {
    Root(RootBlock),
    Minor(MinorBlock),
}

pub struct Master {
    pub root: RootState,
    pub config: ClusterConfig,
    slaves: Vec<SlaveHandle>,
    rpc_timeout: Duration,
    pending_peer_xshard: Vec<(FullShardId, CrossShardTxList)>,
    root_store: Option<RootBlockStore>,
}

impl Master {
    pub fn new(config: ClusterConfig) -> Self {
        let consensus = engine_for(config.root.consensus_type, config.root.pow_config.clone());
        let root = RootState::new(config.root.clone(), consensus);
        Self {
            root,
            config,
            slaves: Vec::new(),
            rpc_timeout: Duration::from_secs(5),
            pending_peer_xshard: Vec::new(),
            root_store: None,
        }
    }

    /// As `new`, but persisting root blocks and the minor-header index
    /// through `db`.
    pub fn with_storage(config: ClusterConfig, db: &Database) -> ClusterResult<Self> {
        let mut master = Self::new(config);
        master.root_store = Some(RootBlockStore::new(db)?);
        Ok(master)
    }

    fn persist_root_block(&self, block: &RootBlock) {
        let Some(store) = &self.root_store else { return };
        if let Err(e) = store.put_block(block) {
            tracing::warn!(error = %e, "failed to persist root block");
            return;
        }
        for header in &block.minor_block_headers {
            if let Err(e) = store.index_minor_header(&header.hash(), &block.hash()) {
                tracing::warn!(error = %e, "failed to persist minor header index entry");
            }
        }
    }

    pub fn register_slave(&mut self, handle: SlaveHandle) {
        self.slaves.push(handle);
    }

    fn slave_for(&self, fsid: &FullShardId) -> ClusterResult<SlaveHandle> {
        self.slaves
            .iter()
            .find(|s| s.owned.contains(fsid))
            .cloned()
            .ok_or_else(|| ClusterError::InvalidBlock(format!("no slave owns shard {fsid}")))
    }

    fn owning_full_shard_id(&self, address: &Address) -> Option<FullShardId> {
        let chain_id = (address.full_shard_key >> 16) as u16;
        let shard_cfg = self.config.shards.iter().find(|s| s.chain_id == chain_id)?;
        Some(FullShardId::new(chain_id, shard_cfg.shard_size, address.shard_id(shard_cfg.shard_size)))
    }

    /// At startup: creates the root genesis, then for every shard with
    /// `genesis_root_height == 0` instructs its owning Slave to create that
    /// shard's genesis minor block linked to the root genesis. Shards with a
    /// later genesis root height stay dormant until that root height is
    /// reached by `add_root_block`.
    pub async fn run_genesis_orchestration(&mut self) -> ClusterResult<()> {
        let genesis_timestamp = self.config.shards.iter().map(|s| s.genesis.timestamp).min().unwrap_or(0);
        let root_genesis = self.root.create_genesis(genesis_timestamp);
        self.persist_root_block(&root_genesis);
        let root_genesis_hash = root_genesis.hash();
        self.create_due_shard_genesis(0, root_genesis_hash).await
    }

    async fn create_due_shard_genesis(&mut self, root_height: u64, root_block_hash: Hash) -> ClusterResult<()> {
        for shard_cfg in self.config.shards.clone() {
            if shard_cfg.genesis.root_height != root_height {
                continue;
            }
            let fsid = shard_cfg.full_shard_id();
            let handle = self.slave_for(&fsid)?;
            if let Ok(SlaveReply::ShardStatus(status)) = handle
                .call(SlaveCommand::GetShardStatus { branch: fsid }, self.rpc_timeout)
                .await
            {
                if status.has_genesis {
                    continue;
                }
            }
            let reply = handle
                .call(
                    SlaveCommand::CreateGenesis {
                        branch: fsid,
                        root_genesis_hash: root_block_hash,
                        timestamp: shard_cfg.genesis.timestamp,
                    },
                    self.rpc_timeout,
                )
                .await?;
            if let SlaveReply::GenesisBlock(block) = reply {
                self.root.add_pending_minor_header(block.header);
            }
        }
        Ok(())
    }

    /// Mine root iff at least one shard has committed a new minor header
    /// since the last root block AND either `prefer_root` or the
    /// root/shard expected-time ratio favors root; otherwise queries every
    /// Slave for its best candidate minor block and returns the one with
    /// highest pending fees.
    pub async fn get_next_block_to_mine(&mut self, coinbase: Address, prefer_root: bool) -> ClusterResult<MinedBlock> {
        let now = now_ts();
        if self.root.has_pending_headers() && (prefer_root || self.root_shard_ratio_favors_root()) {
            let block = self.root.create_block_to_mine(coinbase, &self.config.shards, now)?;
            return Ok(MinedBlock::Root(block));
        }
        let mut best: Option<MinorBlock> = None;
        for fsid in self.config.all_full_shard_ids() {
            let handle = self.slave_for(&fsid)?;
            if let Ok(SlaveReply::MinorBlockMined(block)) = handle
                .call(SlaveCommand::CreateBlockToMine { branch: fsid, coinbase }, self.rpc_timeout)
                .await
            {
                let better = best
                    .as_ref()
                    .map(|b| block.header.coinbase_amount > b.header.coinbase_amount)
                    .unwrap_or(true);
                if better {
                    best = Some(block);
                }
            }
        }
        best.map(MinedBlock::Minor)
            .ok_or_else(|| ClusterError::InvalidBlock("no shard produced a candidate block".into()))
    }

    fn root_shard_ratio_favors_root(&self) -> bool {
        let avg_shard_time: u64 = if self.config.shards.is_empty() {
            return false;
        } else {
            self.config.shards.iter().map(|s| s.target_block_time_sec).sum::<u64>()
                / self.config.shards.len() as u64
        };
        if avg_shard_time == 0 {
            return false;
        }
        self.config.root.target_block_time_sec / avg_shard_time <= 6
    }

    /// Validates, adds to `RootState`, then fans out to every Slave so
    /// ShardStates realign. The fan-out is all-or-nothing: any Slave failure
    /// rolls back the root-block commit.
    pub async fn add_root_block(&mut self, block: RootBlock) -> ClusterResult<()> {
        let reorg = self.root.add_block(block.clone())?;

        // Every accepted root header still gets fanned out below so each
        // Slave's `ShardState` can track it for root-chain-first realignment,
        // even on a losing branch. But `confirmed_minor_hashes` itself
        // refuses to confirm anything for a non-canonical root block, so
        // cross-shard deposits never settle against a side chain.
        let mut confirmed_by_shard = std::collections::HashMap::new();
        for shard_cfg in &self.config.shards {
            let fsid = shard_cfg.full_shard_id();
            confirmed_by_shard.insert(fsid, self.root.confirmed_minor_hashes(&block.hash(), fsid));
        }

        let mut failed = false;
        for slave in self.slaves.clone() {
            let result = slave
                .call(
                    SlaveCommand::AddRootBlock {
                        header: block.header.clone(),
                        confirmed: confirmed_by_shard.clone(),
                    },
                    self.rpc_timeout,
                )
                .await;
            if result.is_err() {
                failed = true;
                break;
            }
        }

        if failed {
            self.root.rollback_block(&block, reorg);
            return Err(ClusterError::InvalidBlock(
                "add_root_block fan-out failed on at least one slave; rolled back".into(),
            ));
        }

        self.persist_root_block(&block);
        self.create_due_shard_genesis(block.header.height, block.hash()).await?;
        Ok(())
    }

    pub async fn add_raw_minor_block(&mut self, branch: FullShardId, bytes: Vec<u8>) -> ClusterResult<()> {
        let block: MinorBlock = bincode::deserialize(&bytes)?;
        self.add_minor_block(branch, block).await
    }

    pub async fn add_minor_block(&mut self, branch: FullShardId, block: MinorBlock) -> ClusterResult<()> {
        let handle = self.slave_for(&branch)?;
        let header = block.header.clone();
        let reply = handle.call(SlaveCommand::AddMinorBlock { branch, block }, self.rpc_timeout).await?;
        if let SlaveReply::MinorBlockAdded(fan_out) = reply {
            self.root.add_pending_minor_header(header);
            for (dest, list) in fan_out {
                match self.slave_for(&dest) {
                    Ok(dest_handle) => {
                        let _ = dest_handle
                            .call(SlaveCommand::HandleXShardTxList { branch: dest, list }, self.rpc_timeout)
                            .await;
                    }
                    Err(_) => self.pending_peer_xshard.push((dest, list)),
                }
            }
        }
        Ok(())
    }

    pub async fn add_transaction(&mut self, tx: Transaction) -> ClusterResult<()> {
        let fsid = self
            .owning_full_shard_id(&tx.from)
            .ok_or_else(|| ClusterError::InvalidTx("no configured shard owns tx.from".into()))?;
        let handle = self.slave_for(&fsid)?;
        handle.call(SlaveCommand::AddTx { branch: fsid, tx }, self.rpc_timeout).await?;
        Ok(())
    }

    pub async fn get_primary_account_data(&self, address: Address) -> ClusterResult<(u128, u64)> {
        let fsid = self
            .owning_full_shard_id(&address)
            .ok_or_else(|| ClusterError::InvalidTx("no configured shard owns address".into()))?;
        let handle = self.slave_for(&fsid)?;
        match handle
            .call(SlaveCommand::GetAccountData { branch: fsid, address }, self.rpc_timeout)
            .await?
        {
            SlaveReply::AccountData { balance, nonce } => Ok((balance, nonce)),
            _ => Err(ClusterError::InvalidBlock("unexpected slave reply".into())),
        }
    }

    pub async fn get_shard_status(&self, branch: FullShardId) -> ClusterResult<ShardStatus> {
        let handle = self.slave_for(&branch)?;
        match handle.call(SlaveCommand::GetShardStatus { branch }, self.rpc_timeout).await? {
            SlaveReply::ShardStatus(status) => Ok(status),
            _ => Err(ClusterError::InvalidBlock("unexpected slave reply".into())),
        }
    }

    /// Answers a peer's `GetRootBlockListRequest`: every requested hash this
    /// cluster actually has, in whatever order `RootState` stores them.
    pub fn root_blocks_by_hash(&self, hashes: &[Hash]) -> Vec<RootBlock> {
        hashes.iter().filter_map(|h| self.root.block(h).cloned()).collect()
    }

    /// Answers a peer's `GetMinorBlockListRequest` for one shard: every
    /// requested hash that shard's Slave actually has.
    pub async fn minor_blocks_by_hash(&self, branch: FullShardId, hashes: Vec<Hash>) -> Vec<MinorBlock> {
        let Ok(handle) = self.slave_for(&branch) else {
            return Vec::new();
        };
        match handle.call(SlaveCommand::GetMinorBlocksByHash { branch, hashes }, self.rpc_timeout).await {
            Ok(SlaveReply::MinorBlocks(blocks)) => blocks,
            _ => Vec::new(),
        }
    }

    /// Entries destined for a shard this cluster does not host locally;
    /// drained by the ClusterPeer task and announced to peers owning them.
    pub fn drain_pending_peer_xshard(&mut self) -> Vec<(FullShardId, CrossShardTxList)> {
        std::mem::take(&mut self.pending_peer_xshard)
    }
}

fn now_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
