//! Canonical root chain: the minor-header index and the reorg engine that
//! every `ShardState` realigns against.

use crate::block::{MinorBlockHeader, RootBlock, RootBlockHeader};
use crate::config::{RootConfig, ShardConfig, COINBASE_AMOUNT_ROOT};
use crate::consensus::{ConsensusEngine, SealableHeader};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{Address, FullShardId, Hash};
use std::collections::{HashMap, HashSet};

/// Emitted when `add_block` changes the canonical tip; every `ShardState`
/// realigns against `new_tip` on receipt.
#[derive(Debug, Clone)]
pub struct RootReorgEvent {
    pub old_tip: Option<Hash>,
    pub new_tip: Hash,
}

pub struct RootState {
    pub config: RootConfig,
    consensus: Box<dyn ConsensusEngine>,

    blocks: HashMap<Hash, RootBlock>,
    parents: HashMap<Hash, Hash>,
    cumulative_difficulty: HashMap<Hash, u128>,
    tip: Option<Hash>,
    genesis: Option<Hash>,

    /// minor header hash -> containing root block hash, for every header
    /// confirmed by a root block currently on the canonical chain.
    minor_header_index: HashMap<Hash, Hash>,

    /// Validated minor headers waiting to be packed into the next root
    /// block, grouped by owning shard, height-ascending.
    pending_headers: HashMap<FullShardId, Vec<MinorBlockHeader>>,
}

impl RootState {
    pub fn new(config: RootConfig, consensus: Box<dyn ConsensusEngine>) -> Self {
        Self {
            config,
            consensus,
            blocks: HashMap::new(),
            parents: HashMap::new(),
            cumulative_difficulty: HashMap::new(),
            tip: None,
            genesis: None,
            minor_header_index: HashMap::new(),
            pending_headers: HashMap::new(),
        }
    }

    pub fn has_genesis(&self) -> bool {
        self.genesis.is_some()
    }

    pub fn create_genesis(&mut self, timestamp: u64) -> RootBlock {
        let header = RootBlockHeader {
            height: 0,
            hash_prev_root_block: [0u8; 32],
            minor_header_merkle_root: RootBlock::minor_header_merkle_root(&[]),
            timestamp,
            difficulty: 1,
            nonce: 0,
            coinbase_address: self.config.coinbase_address,
            coinbase_amount: 0,
        };
        let block = RootBlock {
            header,
            minor_block_headers: Vec::new(),
        };
        let hash = block.hash();
        self.blocks.insert(hash, block.clone());
        self.cumulative_difficulty.insert(hash, block.header.difficulty as u128);
        self.parents.insert(hash, [0u8; 32]);
        self.tip = Some(hash);
        self.genesis = Some(hash);
        block
    }

    pub fn tip_hash(&self) -> Option<Hash> {
        self.tip
    }

    pub fn tip_height(&self) -> u64 {
        self.tip
            .and_then(|h| self.blocks.get(&h))
            .map(|b| b.header.height)
            .unwrap_or(0)
    }

    pub fn header(&self, hash: &Hash) -> Option<&RootBlockHeader> {
        self.blocks.get(hash).map(|b| &b.header)
    }

    pub fn is_minor_block_validated(&self, hash: &Hash) -> bool {
        self.minor_header_index.contains_key(hash)
    }

    pub fn has_pending_headers(&self) -> bool {
        self.pending_headers.values().any(|v| !v.is_empty())
    }

    /// Undoes a just-committed `add_block` when the all-or-nothing Slave
    /// fan-out failed partway through: removes the block and its index
    /// entries and restores the previous tip.
    pub fn rollback_block(&mut self, block: &RootBlock, reorg: Option<RootReorgEvent>) {
        let hash = block.hash();
        self.blocks.remove(&hash);
        self.cumulative_difficulty.remove(&hash);
        self.parents.remove(&hash);
        if let Some(event) = reorg {
            self.tip = event.old_tip;
        }
        self.reindex_canonical_minor_headers();
    }

    /// True iff `hash` names a root block on the chain ending at the current
    /// tip, i.e. it is (or is an ancestor of) the canonical root block.
    pub fn is_canonical(&self, hash: &Hash) -> bool {
        let mut cur = self.tip;
        while let Some(h) = cur {
            if h == *hash {
                return true;
            }
            cur = self.parents.get(&h).copied().filter(|p| *p != h);
        }
        false
    }

    /// Rebuilds `minor_header_index`/`pending_headers` from scratch against
    /// the current tip's ancestry. Headers confirmed only by a root block
    /// that has fallen off the canonical chain are evicted from the index
    /// and handed back to `pending_headers` so a later root block can
    /// re-confirm them; headers confirmed by a block still on the canonical
    /// path are (re-)indexed and dropped from the pending pool.
    fn reindex_canonical_minor_headers(&mut self) {
        let mut canonical: HashSet<Hash> = HashSet::new();
        let mut cur = self.tip;
        while let Some(h) = cur {
            canonical.insert(h);
            cur = self.parents.get(&h).copied().filter(|p| *p != h);
        }

        let mut stale = Vec::new();
        let mut orphaned_headers = Vec::new();
        for (header_hash, root_hash) in &self.minor_header_index {
            if canonical.contains(root_hash) {
                continue;
            }
            stale.push(*header_hash);
            if let Some(header) = self
                .blocks
                .get(root_hash)
                .and_then(|b| b.minor_block_headers.iter().find(|h| h.hash() == *header_hash))
            {
                orphaned_headers.push(header.clone());
            }
        }
        for header_hash in stale {
            self.minor_header_index.remove(&header_hash);
        }
        for header in orphaned_headers {
            self.pending_headers.entry(header.branch).or_default().push(header);
        }

        for root_hash in &canonical {
            let Some(block) = self.blocks.get(root_hash) else { continue };
            for header in &block.minor_block_headers {
                self.minor_header_index.entry(header.hash()).or_insert(*root_hash);
                if let Some(pending) = self.pending_headers.get_mut(&header.branch) {
                    pending.retain(|h| h.hash() != header.hash());
                }
            }
        }
    }

    /// Records a minor header a shard has validated as admissible for
    /// inclusion in the next root block.
    pub fn add_pending_minor_header(&mut self, header: MinorBlockHeader) {
        self.pending_headers
            .entry(header.branch)
            .or_default()
            .push(header);
    }

    /// Assembles a root block from currently-pending validated minor
    /// headers, preserving per-shard height-ascending order and respecting
    /// `max_blocks_per_shard_in_one_root_block`.
    pub fn create_block_to_mine(
        &mut self,
        coinbase: Address,
        shard_configs: &[ShardConfig],
        timestamp: u64,
    ) -> ClusterResult<RootBlock> {
        let tip = self.tip.ok_or_else(|| ClusterError::InvalidBlock("root chain has no genesis yet".into()))?;
        let parent = self.blocks.get(&tip).cloned().unwrap();

        let mut included = Vec::new();
        for shard_cfg in shard_configs {
            let fsid = shard_cfg.full_shard_id();
            let Some(pending) = self.pending_headers.get(&fsid) else {
                continue;
            };
            let max = shard_cfg.max_blocks_per_shard_in_one_root_block(&self.config) as usize;
            let mut sorted: Vec<MinorBlockHeader> = pending.clone();
            sorted.sort_by_key(|h| h.height);
            included.extend(sorted.into_iter().take(max));
        }

        let header = RootBlockHeader {
            height: parent.header.height + 1,
            hash_prev_root_block: tip,
            minor_header_merkle_root: RootBlock::minor_header_merkle_root(&included),
            timestamp,
            difficulty: self.consensus.next_difficulty(parent.header.difficulty, 1),
            nonce: 0,
            coinbase_address: coinbase,
            coinbase_amount: COINBASE_AMOUNT_ROOT,
        };
        Ok(RootBlock {
            header,
            minor_block_headers: included,
        })
    }

    /// Validates PoW, parent link, and that every referenced minor header is
    /// known; updates the tip by highest cumulative difficulty. Returns the
    /// reorg event iff the tip actually changed.
    pub fn add_block(&mut self, block: RootBlock) -> ClusterResult<Option<RootReorgEvent>> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Ok(None);
        }
        let parent = self
            .blocks
            .get(&block.header.hash_prev_root_block)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownAncestor(hex::encode(block.header.hash_prev_root_block)))?;

        if block.header.timestamp <= parent.header.timestamp {
            return Err(ClusterError::InvalidBlock("root timestamp not monotonic".into()));
        }
        let sealable = SealableHeader {
            hash_without_nonce: &block.header.hash_prev_root_block,
            nonce: block.header.nonce,
            difficulty: block.header.difficulty,
        };
        self.consensus.verify_seal(&sealable)?;
        if block.header.minor_header_merkle_root != RootBlock::minor_header_merkle_root(&block.minor_block_headers) {
            // Same class of fault as the minor-chain check in
            // `ShardState::add_block`: the header's own commitment doesn't
            // match its payload.
            return Err(ClusterError::IntegrityError("root block minor header merkle root mismatch".into()));
        }

        let cumulative =
            self.cumulative_difficulty.get(&parent.hash()).copied().unwrap_or(0) + block.header.difficulty as u128;

        self.blocks.insert(hash, block);
        self.cumulative_difficulty.insert(hash, cumulative);
        self.parents.insert(hash, parent.hash());

        let current_cumulative = self.tip.and_then(|t| self.cumulative_difficulty.get(&t)).copied().unwrap_or(0);
        let old_tip = self.tip;
        if cumulative > current_cumulative || (cumulative == current_cumulative && hash > old_tip.unwrap_or([0u8; 32])) {
            self.tip = Some(hash);
        }
        // Only a root block still on the canonical path may confirm minor
        // headers; this also evicts anything orphaned by a reorg just now.
        self.reindex_canonical_minor_headers();

        if old_tip != self.tip {
            return Ok(Some(RootReorgEvent { old_tip, new_tip: hash }));
        }
        Ok(None)
    }

    /// All of `full_shard_id`'s minor header hashes confirmed by
    /// `root_block_hash`, or empty if that root block is not (or is no
    /// longer) on the canonical root chain.
    pub fn confirmed_minor_hashes(&self, root_block_hash: &Hash, full_shard_id: FullShardId) -> Vec<Hash> {
        if !self.is_canonical(root_block_hash) {
            return Vec::new();
        }
        self.blocks
            .get(root_block_hash)
            .map(|b| {
                b.minor_block_headers
                    .iter()
                    .filter(|h| h.branch == full_shard_id)
                    .map(|h| h.hash())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn block(&self, hash: &Hash) -> Option<&RootBlock> {
        self.blocks.get(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusType;
    use crate::consensus::NoneEngine;

    fn make_root() -> RootState {
        let cfg = RootConfig {
            consensus_type: ConsensusType::None,
            pow_config: None,
            target_block_time_sec: 60,
            coinbase_address: Address::new([0u8; 20], 0),
            max_stale_root_block_height_diff: 60,
        };
        RootState::new(cfg, Box::new(NoneEngine))
    }

    #[test]
    fn genesis_then_one_block_advances_tip() {
        let mut root = make_root();
        let genesis = root.create_genesis(1);
        let next = root
            .create_block_to_mine(Address::new([1u8; 20], 0), &[], genesis.header.timestamp + 1)
            .unwrap();
        let event = root.add_block(next.clone()).unwrap();
        assert!(event.is_some());
        assert_eq!(root.tip_hash(), Some(next.hash()));
    }

    #[test]
    fn add_block_twice_is_noop() {
        let mut root = make_root();
        let genesis = root.create_genesis(1);
        let next = root
            .create_block_to_mine(Address::new([1u8; 20], 0), &[], genesis.header.timestamp + 1)
            .unwrap();
        root.add_block(next.clone()).unwrap();
        let tip_before = root.tip_hash();
        let result = root.add_block(next).unwrap();
        assert!(result.is_none());
        assert_eq!(root.tip_hash(), tip_before);
    }
}
