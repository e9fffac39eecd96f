//! Cluster configuration: topology, consensus selection, and genesis.
//!
//! Loaded once at startup from a JSON or TOML file and never mutated; every
//! derived quantity (`max_blocks_per_shard_in_one_root_block`,
//! `max_stale_minor_block_height_diff`) is a computed view taking the
//! relevant config as an explicit argument rather than a back-pointer.

use crate::error::{ClusterError, ClusterResult};
use crate::types::{Address, FullShardId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Base-unit reward for mining a shard block, before tax.
pub const COINBASE_AMOUNT_SHARD: u128 = 5_000_000_000_000_000_000;
/// Base-unit reward for mining a root block.
pub const COINBASE_AMOUNT_ROOT: u128 = 120_000_000_000_000_000_000;
/// The fraction of a shard's block reward withheld and routed to the root
/// chain's coinbase instead of paid directly on the shard.
pub const REWARD_TAX_RATE_NUM: u64 = 1;
pub const REWARD_TAX_RATE_DEN: u64 = 2;

/// Gas floor for an intra-shard transaction.
pub const GTXCOST: u64 = 21_000;
/// Gas floor for the source-side half of a cross-shard transaction.
pub const GTXXSHARDCOST: u64 = 9_000;

pub const EXTRA_SHARD_BLOCKS_IN_ROOT_BLOCK: u64 = 3;
pub const MAX_STALE_ROOT_BLOCK_HEIGHT_DIFF: u64 = 60;
pub const TRANSACTION_QUEUE_SIZE_LIMIT_PER_SHARD: usize = 10_000;

/// Which PoW family (if any) a chain's blocks are sealed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    None,
    Ethash,
    DoubleSha256,
    Simulate,
    QkcHash,
}

/// Parameters only meaningful for PoW-backed consensus types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowConfig {
    pub target_block_time_sec: u64,
    pub remote_mine: bool,
    pub difficulty_adjustment_cutoff_time_sec: u64,
    pub difficulty_adjustment_factor: u64,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            target_block_time_sec: 10,
            remote_mine: false,
            difficulty_adjustment_cutoff_time_sec: 7,
            difficulty_adjustment_factor: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub root_height: u64,
    pub timestamp: u64,
    pub difficulty: u64,
    pub gas_limit: u64,
    pub alloc: HashMap<String, u128>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            root_height: 0,
            timestamp: 0,
            difficulty: 1,
            gas_limit: 30_000_000,
            alloc: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub chain_id: u16,
    pub shard_size: u16,
    pub shard_id: u16,
    pub consensus_type: ConsensusType,
    pub pow_config: Option<PowConfig>,
    pub coinbase_address: Address,
    pub genesis: GenesisConfig,
    pub target_block_time_sec: u64,
    pub max_tx_pool_size: usize,
}

impl ShardConfig {
    pub fn full_shard_id(&self) -> FullShardId {
        FullShardId::new(self.chain_id, self.shard_size, self.shard_id)
    }

    /// How many of this shard's minor headers a single root block may
    /// confirm: root-to-shard target time ratio plus a slack constant.
    pub fn max_blocks_per_shard_in_one_root_block(&self, root: &RootConfig) -> u64 {
        let ratio = if self.target_block_time_sec == 0 {
            1
        } else {
            root.target_block_time_sec / self.target_block_time_sec
        };
        ratio.max(1) + EXTRA_SHARD_BLOCKS_IN_ROOT_BLOCK
    }

    /// How far behind the current tip a minor block's height may fall before
    /// it is treated as `StaleBlock` rather than buffered for sync.
    pub fn max_stale_minor_block_height_diff(&self, root: &RootConfig) -> u64 {
        self.max_blocks_per_shard_in_one_root_block(root) * MAX_STALE_ROOT_BLOCK_HEIGHT_DIFF
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    pub consensus_type: ConsensusType,
    pub pow_config: Option<PowConfig>,
    pub target_block_time_sec: u64,
    pub coinbase_address: Address,
    pub max_stale_root_block_height_diff: u64,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            consensus_type: ConsensusType::Simulate,
            pow_config: Some(PowConfig {
                target_block_time_sec: 60,
                ..Default::default()
            }),
            target_block_time_sec: 60,
            coinbase_address: Address::new([0u8; 20], 0),
            max_stale_root_block_height_diff: MAX_STALE_ROOT_BLOCK_HEIGHT_DIFF,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub network_id: u32,
    pub version: u32,
    pub p2p_port: u16,
    pub json_rpc_port: u16,
    pub metrics_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub root: RootConfig,
    pub shards: Vec<ShardConfig>,
    /// Directory holding the sled database; `None` runs fully in-memory
    /// (used by tests and `ClusterConfig::default()`).
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let root = RootConfig::default();
        let mut shards = Vec::new();
        for shard_id in 0..2u16 {
            shards.push(ShardConfig {
                chain_id: 0,
                shard_size: 2,
                shard_id,
                consensus_type: ConsensusType::Simulate,
                pow_config: Some(PowConfig::default()),
                coinbase_address: Address::new([0u8; 20], shard_id as u32),
                genesis: GenesisConfig::default(),
                target_block_time_sec: 10,
                max_tx_pool_size: TRANSACTION_QUEUE_SIZE_LIMIT_PER_SHARD,
            });
        }
        Self {
            network_id: 1,
            version: 1,
            p2p_port: 38291,
            json_rpc_port: 38491,
            metrics_port: 39091,
            bootstrap_peers: Vec::new(),
            root,
            shards,
            data_dir: None,
        }
    }
}

impl ClusterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ClusterError::Config(format!("failed to read config file: {e}")))?;
        let parsed = if path.as_ref().extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&content)
                .map_err(|e| ClusterError::Config(format!("failed to parse toml config: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| ClusterError::Config(format!("failed to parse json config: {e}")))?
        };
        let cfg: ClusterConfig = parsed;
        cfg.init_and_validate()?;
        Ok(cfg)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ClusterResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ClusterError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| ClusterError::Config(format!("failed to write config file: {e}")))?;
        Ok(())
    }

    pub fn shard_config(&self, full_shard_id: FullShardId) -> Option<&ShardConfig> {
        self.shards
            .iter()
            .find(|s| s.full_shard_id() == full_shard_id)
    }

    /// Validates the closed schema invariants spec.md §6 requires:
    /// `shard_size` is a power of two, per-chain `shard_id`s cover
    /// `0..shard_size`, and `chain_id`s cover `0..chain_size`.
    pub fn init_and_validate(&self) -> ClusterResult<()> {
        if self.shards.is_empty() {
            return Err(ClusterError::Config("no shards configured".into()));
        }
        let mut by_chain: HashMap<u16, Vec<&ShardConfig>> = HashMap::new();
        for s in &self.shards {
            if !s.shard_size.is_power_of_two() {
                return Err(ClusterError::Config(format!(
                    "shard_size {} for chain {} is not a power of two",
                    s.shard_size, s.chain_id
                )));
            }
            if s.shard_id >= s.shard_size {
                return Err(ClusterError::Config(format!(
                    "shard_id {} out of range for shard_size {}",
                    s.shard_id, s.shard_size
                )));
            }
            by_chain.entry(s.chain_id).or_default().push(s);
        }
        for (chain_id, shards) in &by_chain {
            let shard_size = shards[0].shard_size;
            if shards.iter().any(|s| s.shard_size != shard_size) {
                return Err(ClusterError::Config(format!(
                    "chain {chain_id} has inconsistent shard_size across its shards"
                )));
            }
            let mut ids: Vec<u16> = shards.iter().map(|s| s.shard_id).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != shard_size as usize || ids != (0..shard_size).collect::<Vec<_>>() {
                return Err(ClusterError::Config(format!(
                    "chain {chain_id} shard_ids do not cover 0..{shard_size}"
                )));
            }
        }
        let mut chain_ids: Vec<u16> = by_chain.keys().copied().collect();
        chain_ids.sort_unstable();
        if chain_ids != (0..chain_ids.len() as u16).collect::<Vec<_>>() {
            return Err(ClusterError::Config(
                "chain_ids do not cover 0..chain_size".into(),
            ));
        }
        Ok(())
    }

    pub fn all_full_shard_ids(&self) -> Vec<FullShardId> {
        self.shards.iter().map(|s| s.full_shard_id()).collect()
    }

    /// Full shard ids whose genesis must exist already at root height `h`.
    pub fn full_shard_ids_initialized_before_root_height(&self, h: u64) -> Vec<FullShardId> {
        self.shards
            .iter()
            .filter(|s| s.genesis.root_height <= h)
            .map(|s| s.full_shard_id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ClusterConfig::default().init_and_validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_shard_size() {
        let mut cfg = ClusterConfig::default();
        cfg.shards[0].shard_size = 3;
        assert!(cfg.init_and_validate().is_err());
    }

    #[test]
    fn rejects_incomplete_shard_id_coverage() {
        let mut cfg = ClusterConfig::default();
        cfg.shards.pop();
        assert!(cfg.init_and_validate().is_err());
    }

    #[test]
    fn max_blocks_per_shard_uses_time_ratio_plus_slack() {
        let root = RootConfig {
            target_block_time_sec: 60,
            ..RootConfig::default()
        };
        let shard = ShardConfig {
            chain_id: 0,
            shard_size: 2,
            shard_id: 0,
            consensus_type: ConsensusType::Simulate,
            pow_config: None,
            coinbase_address: Address::new([0u8; 20], 0),
            genesis: GenesisConfig::default(),
            target_block_time_sec: 10,
            max_tx_pool_size: 10,
        };
        assert_eq!(shard.max_blocks_per_shard_in_one_root_block(&root), 9);
    }
}
