//! Per-shard ledger: canonical chain, mempool, account state, and the
//! cross-shard inbox/outbox.

use crate::block::{CrossShardDeposit, CrossShardTxList, MinorBlock, MinorBlockHeader, Transaction};
use crate::config::{RootConfig, ShardConfig, COINBASE_AMOUNT_SHARD, REWARD_TAX_RATE_DEN, REWARD_TAX_RATE_NUM};
use crate::consensus::{ConsensusEngine, SealableHeader};
use crate::error::{ClusterError, ClusterResult};
use crate::evm::{AccountState, BlockContext, ExecutionEngine};
use crate::types::{Address, FullShardId, Hash};
use std::collections::{HashMap, HashSet, VecDeque};

pub struct ShardState {
    pub config: ShardConfig,
    consensus: Box<dyn ConsensusEngine>,
    execution: Box<dyn ExecutionEngine>,

    blocks: HashMap<Hash, MinorBlock>,
    cumulative_difficulty: HashMap<Hash, u128>,
    tip: Option<Hash>,
    genesis: Option<Hash>,

    mempool: HashMap<Hash, Transaction>,
    mempool_order: VecDeque<Hash>,

    /// The canonical tip's account ledger — always equal to
    /// `account_snapshots[self.tip]`, kept as a field so callers don't pay
    /// for a map lookup on every balance/nonce read.
    accounts: HashMap<Address, AccountState>,
    /// Per-block account ledgers, keyed by the minor block hash whose
    /// execution produced them. A side-branch block's execution lands only
    /// here, never in `accounts`, until (if ever) that branch becomes
    /// canonical.
    account_snapshots: HashMap<Hash, HashMap<Address, AccountState>>,

    /// This shard's own extracted cross-shard lists, keyed by the minor
    /// block hash that produced them.
    outbox: HashMap<Hash, CrossShardTxList>,
    /// Entries received from neighbor shards, keyed by the *source* minor
    /// block hash, not yet confirmed by a root block.
    pending_inbox: HashMap<Hash, CrossShardTxList>,
    /// Confirmed but not yet applied to account state (applied at the next
    /// block this shard produces or accepts).
    ready_deposits: VecDeque<CrossShardDeposit>,
    /// Source minor block hashes whose deposits have already been applied.
    applied_sources: HashSet<Hash>,

    root_tip: Hash,
    root_tip_height: u64,
    root_parents: HashMap<Hash, Hash>,
    root_heights: HashMap<Hash, u64>,
    /// Cumulative root-chain difficulty per root block hash, tracked the same
    /// way `RootState::add_block` does so this shard's notion of "heaviest
    /// root branch" can't diverge from the root chain's own tip selection.
    root_cumulative_difficulty: HashMap<Hash, u128>,
}

impl ShardState {
    pub fn new(config: ShardConfig, consensus: Box<dyn ConsensusEngine>, execution: Box<dyn ExecutionEngine>) -> Self {
        Self {
            config,
            consensus,
            execution,
            blocks: HashMap::new(),
            cumulative_difficulty: HashMap::new(),
            tip: None,
            genesis: None,
            mempool: HashMap::new(),
            mempool_order: VecDeque::new(),
            accounts: HashMap::new(),
            account_snapshots: HashMap::new(),
            outbox: HashMap::new(),
            pending_inbox: HashMap::new(),
            ready_deposits: VecDeque::new(),
            applied_sources: HashSet::new(),
            root_tip: [0u8; 32],
            root_tip_height: 0,
            root_parents: HashMap::new(),
            root_heights: HashMap::new(),
            root_cumulative_difficulty: HashMap::new(),
        }
    }

    pub fn full_shard_id(&self) -> FullShardId {
        self.config.full_shard_id()
    }

    pub fn has_genesis(&self) -> bool {
        self.genesis.is_some()
    }

    /// Creates this shard's genesis minor block anchored to `root_genesis_hash`,
    /// seeding account balances from the shard's configured `alloc`.
    pub fn create_genesis(&mut self, root_genesis_hash: Hash, root_genesis_timestamp: u64) -> ClusterResult<MinorBlock> {
        if self.genesis.is_some() {
            return Err(ClusterError::InvalidBlock("genesis already created".into()));
        }
        for (addr_hex, balance) in &self.config.genesis.alloc {
            let bytes = hex::decode(addr_hex)
                .map_err(|e| ClusterError::Config(format!("bad genesis alloc address: {e}")))?;
            if bytes.len() != 20 {
                return Err(ClusterError::Config("genesis alloc address must be 20 bytes".into()));
            }
            let mut recipient = [0u8; 20];
            recipient.copy_from_slice(&bytes);
            let addr = Address::new(recipient, self.config.full_shard_id().raw());
            self.accounts.insert(
                addr,
                AccountState {
                    balance: *balance,
                    nonce: 0,
                },
            );
        }
        let header = MinorBlockHeader {
            branch: self.full_shard_id(),
            height: 0,
            hash_prev_minor_block: [0u8; 32],
            hash_prev_root_block: root_genesis_hash,
            tx_merkle_root: MinorBlock::merkle_root(&[]),
            timestamp: root_genesis_timestamp,
            difficulty: self.config.genesis.difficulty,
            nonce: 0,
            coinbase_address: self.config.coinbase_address,
            coinbase_amount: 0,
        };
        let block = MinorBlock {
            header,
            transactions: Vec::new(),
        };
        let hash = block.hash();
        self.blocks.insert(hash, block.clone());
        self.cumulative_difficulty.insert(hash, block.header.difficulty as u128);
        self.account_snapshots.insert(hash, self.accounts.clone());
        self.tip = Some(hash);
        self.genesis = Some(hash);
        self.root_tip = root_genesis_hash;
        self.root_tip_height = 0;
        self.root_parents.insert(root_genesis_hash, [0u8; 32]);
        self.root_heights.insert(root_genesis_hash, 0);
        // The root genesis block is always mined with difficulty 1 (the same
        // constant `RootState::create_genesis` uses), so cumulative
        // difficulty tracking here starts in lockstep with the root chain's.
        self.root_cumulative_difficulty.insert(root_genesis_hash, 1);
        Ok(block)
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

    pub fn contain_block_by_hash(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn contain_remote_minor_block_hash(&self, hash: &Hash) -> bool {
        self.pending_inbox.contains_key(hash) || self.applied_sources.contains(hash)
    }

    pub fn get_balance(&self, address: &Address) -> u128 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    pub fn get_nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<&MinorBlock> {
        self.blocks.get(hash)
    }

    pub fn get_minor_block_by_height(&self, height: u64) -> Option<&MinorBlock> {
        let mut cur = self.tip?;
        loop {
            let block = self.blocks.get(&cur)?;
            if block.header.height == height {
                return Some(block);
            }
            if block.header.height < height {
                return None;
            }
            cur = block.header.hash_prev_minor_block;
        }
    }

    pub fn get_minor_block_xshard_tx_list(&self, hash: &Hash) -> Option<&CrossShardTxList> {
        self.outbox.get(hash)
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    /// Validates signature, nonce, gas, and shard ownership of `tx.from`;
    /// admits to the mempool. Overflow rejects the newest entry (the one
    /// just submitted).
    pub fn add_transaction(&mut self, tx: Transaction) -> ClusterResult<()> {
        if !tx.verify_signature() {
            return Err(ClusterError::InvalidTx("bad signature".into()));
        }
        if tx.from.shard_id(self.config.shard_size) != self.config.shard_id {
            return Err(ClusterError::InvalidTx("tx.from does not belong to this shard".into()));
        }
        let account_nonce = self.accounts.get(&tx.from).map(|a| a.nonce).unwrap_or(0);
        if tx.nonce != account_nonce {
            return Err(ClusterError::InvalidTx(format!(
                "nonce mismatch: tx has {}, account has {account_nonce}",
                tx.nonce
            )));
        }
        let min_gas = if self.is_cross_shard(&tx) {
            crate::config::GTXXSHARDCOST + crate::config::GTXCOST
        } else {
            crate::config::GTXCOST
        };
        if tx.gas < min_gas {
            return Err(ClusterError::InvalidTx("gas below floor".into()));
        }
        if self.mempool.len() >= self.config.max_tx_pool_size {
            return Err(ClusterError::InvalidTx("mempool full".into()));
        }
        self.mempool.insert(tx.hash, tx.clone());
        self.mempool_order.push_back(tx.hash);
        Ok(())
    }

    fn is_cross_shard(&self, tx: &Transaction) -> bool {
        tx.to.shard_id(self.config.shard_size) != self.config.shard_id
    }

    /// Produces a candidate minor block bound to the shard's current
    /// root-tip, selecting mempool transactions by gas-price priority.
    pub fn create_block_to_mine(&mut self, coinbase: Address) -> ClusterResult<MinorBlock> {
        let tip = self.tip.ok_or_else(|| ClusterError::InvalidBlock("shard has no genesis yet".into()))?;
        let parent = self.blocks.get(&tip).unwrap().clone();

        let mut candidates: Vec<Transaction> = self.mempool.values().cloned().collect();
        candidates.sort_by(|a, b| b.gas_price.cmp(&a.gas_price));

        let mut scratch = self.accounts.clone();
        let mut included = Vec::new();
        let mut total_fee: u128 = 0;
        let ctx = BlockContext {
            height: parent.header.height + 1,
            timestamp: parent.header.timestamp + 1,
        };
        for tx in candidates {
            let cross_shard = self.is_cross_shard(&tx);
            match self.execution.execute(&mut scratch, &tx, ctx, cross_shard) {
                Ok(receipt) => {
                    total_fee += receipt.fee_paid;
                    included.push(tx);
                }
                Err(_) => continue,
            }
        }

        // Preview only: ready deposits are actually applied to account state
        // in `add_block`, once this candidate (or another) is committed.
        for deposit in &self.ready_deposits {
            let acc = scratch.entry(deposit.to).or_default();
            acc.balance += deposit.value;
        }

        let reward = COINBASE_AMOUNT_SHARD * REWARD_TAX_RATE_NUM as u128 / REWARD_TAX_RATE_DEN as u128 + total_fee;
        let coinbase_acc = scratch.entry(coinbase).or_default();
        coinbase_acc.balance += reward;

        let header = MinorBlockHeader {
            branch: self.full_shard_id(),
            height: parent.header.height + 1,
            hash_prev_minor_block: tip,
            hash_prev_root_block: self.root_tip,
            tx_merkle_root: MinorBlock::merkle_root(&included),
            timestamp: ctx.timestamp,
            difficulty: self
                .consensus
                .next_difficulty(parent.header.difficulty, 1),
            nonce: 0,
            coinbase_address: coinbase,
            coinbase_amount: reward,
        };
        Ok(MinorBlock {
            header,
            transactions: included,
        })
    }

    /// Validates and admits `block`. Returns the cross-shard lists to fan
    /// out, grouped by destination full-shard-id, restricted to neighbor
    /// shards only.
    pub fn add_block(&mut self, block: MinorBlock) -> ClusterResult<HashMap<FullShardId, CrossShardTxList>> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            // add_block(b) twice is a no-op success.
            return Ok(HashMap::new());
        }
        let parent = self
            .blocks
            .get(&block.header.hash_prev_minor_block)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownAncestor(hex::encode(block.header.hash_prev_minor_block)))?;

        if block.header.timestamp <= parent.header.timestamp {
            return Err(ClusterError::InvalidBlock("timestamp not monotonic".into()));
        }
        if !self.root_parents.contains_key(&block.header.hash_prev_root_block) {
            return Err(ClusterError::InvalidBlock(
                "hash_prev_root_block not known to this shard".into(),
            ));
        }
        let sealable = SealableHeader {
            hash_without_nonce: &block.header.hash_prev_minor_block,
            nonce: block.header.nonce,
            difficulty: block.header.difficulty,
        };
        self.consensus.verify_seal(&sealable)?;

        if block.header.tx_merkle_root != MinorBlock::merkle_root(&block.transactions) {
            // The header commits to a merkle root that doesn't match its own
            // transaction list: not a validation failure on bad peer input,
            // a fabricated or corrupted block.
            return Err(ClusterError::IntegrityError("minor block tx merkle root mismatch".into()));
        }

        // Execute against the parent block's own ledger, not the live tip's —
        // a block built on a side branch must never see (or mutate) the
        // canonical chain's account state.
        let mut scratch = self
            .account_snapshots
            .get(&block.header.hash_prev_minor_block)
            .cloned()
            .unwrap_or_default();
        let ctx = BlockContext {
            height: block.header.height,
            timestamp: block.header.timestamp,
        };
        let mut xshard_out: HashMap<FullShardId, CrossShardTxList> = HashMap::new();
        for tx in &block.transactions {
            let cross_shard = self.is_cross_shard(tx);
            let receipt = self.execution.execute(&mut scratch, tx, ctx, cross_shard)?;
            if !receipt.success {
                return Err(ClusterError::InvalidTx("execution failed".into()));
            }
            if cross_shard {
                let dest_shard = tx.to.full_shard_id(self.full_shard_id().chain_id(), self.config.shard_size);
                if !self.full_shard_id().is_neighbor_of(&dest_shard) {
                    continue;
                }
                let entry = xshard_out.entry(dest_shard).or_insert_with(|| CrossShardTxList {
                    minor_block_hash: hash,
                    deposits: Vec::new(),
                });
                entry.deposits.push(CrossShardDeposit {
                    tx_hash: tx.hash,
                    from: tx.from,
                    to: tx.to,
                    value: tx.value,
                });
            }
        }
        for deposit in self.ready_deposits.drain(..) {
            let acc = scratch.entry(deposit.to).or_default();
            acc.balance += deposit.value;
        }
        let coinbase_acc = scratch.entry(block.header.coinbase_address).or_default();
        coinbase_acc.balance += block.header.coinbase_amount;

        let cumulative = self.cumulative_difficulty.get(&parent.hash()).copied().unwrap_or(0)
            + block.header.difficulty as u128;

        let is_root_ancestor = self.is_root_ancestor(&block.header.hash_prev_root_block, &self.root_tip);
        self.account_snapshots.insert(hash, scratch.clone());
        for tx in &block.transactions {
            if self.mempool.remove(&tx.hash).is_some() {
                self.mempool_order.retain(|h| *h != tx.hash);
            }
        }
        self.blocks.insert(hash, block.clone());
        self.cumulative_difficulty.insert(hash, cumulative);
        if !xshard_out.is_empty() {
            self.outbox.insert(
                hash,
                CrossShardTxList {
                    minor_block_hash: hash,
                    deposits: xshard_out.values().flat_map(|l| l.deposits.clone()).collect(),
                },
            );
        }

        if is_root_ancestor {
            let current_cumulative = self
                .tip
                .and_then(|t| self.cumulative_difficulty.get(&t))
                .copied()
                .unwrap_or(0);
            if cumulative > current_cumulative || (cumulative == current_cumulative && hash > self.tip.unwrap_or([0u8; 32])) {
                self.tip = Some(hash);
                self.accounts = scratch;
            }
        }

        Ok(xshard_out)
    }

    /// Informs the shard that `header` is now canonical on the root chain,
    /// and that it confirms `confirmed_minor_hashes` (this shard's own
    /// headers referenced by that root block). Pending inbox entries whose
    /// source hash is confirmed become ready to apply at the next block.
    pub fn add_root_block(
        &mut self,
        header: crate::block::RootBlockHeader,
        confirmed_minor_hashes: &[Hash],
    ) -> ClusterResult<()> {
        let hash = header.hash();
        self.root_parents.insert(hash, header.hash_prev_root_block);
        self.root_heights.insert(hash, header.height);
        let parent_cumulative = self
            .root_cumulative_difficulty
            .get(&header.hash_prev_root_block)
            .copied()
            .unwrap_or(0);
        let new_cumulative = parent_cumulative + header.difficulty as u128;
        self.root_cumulative_difficulty.insert(hash, new_cumulative);

        // Same cumulative-difficulty-with-hash-tiebreak rule `RootState`
        // uses to pick its own tip, so the two never disagree on which root
        // branch is canonical once difficulty varies across blocks.
        let current_cumulative = self.root_cumulative_difficulty.get(&self.root_tip).copied().unwrap_or(0);
        if new_cumulative > current_cumulative || (new_cumulative == current_cumulative && hash > self.root_tip) {
            self.root_tip = hash;
            self.root_tip_height = header.height;
        }

        for source_hash in confirmed_minor_hashes {
            if self.applied_sources.contains(source_hash) {
                continue;
            }
            if let Some(list) = self.pending_inbox.remove(source_hash) {
                self.applied_sources.insert(*source_hash);
                self.ready_deposits.extend(list.deposits);
            }
        }

        // Root-chain-first: realign the shard tip to the highest-difficulty
        // block still anchored on the (possibly new) canonical root path.
        let tip_before = self.tip;
        self.realign_tip_to_root();
        if self.tip != tip_before {
            self.evict_stale_mempool_entries();
        }
        Ok(())
    }

    /// Drops mempool entries whose nonce has fallen behind the account's
    /// nonce after a root-driven reorg moved the tip to a branch that never
    /// included them.
    fn evict_stale_mempool_entries(&mut self) {
        let stale: Vec<Hash> = self
            .mempool
            .iter()
            .filter(|(_, tx)| {
                let account_nonce = self.accounts.get(&tx.from).map(|a| a.nonce).unwrap_or(0);
                tx.nonce < account_nonce
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            self.mempool.remove(&hash);
            self.mempool_order.retain(|h| *h != hash);
        }
    }

    fn realign_tip_to_root(&mut self) {
        let mut best: Option<(Hash, u128)> = None;
        for (hash, block) in &self.blocks {
            if !self.is_root_ancestor(&block.header.hash_prev_root_block, &self.root_tip) {
                continue;
            }
            let cumulative = self.cumulative_difficulty.get(hash).copied().unwrap_or(0);
            best = match best {
                Some((best_hash, best_cum)) if best_cum > cumulative || (best_cum == cumulative && best_hash >= *hash) => {
                    Some((best_hash, best_cum))
                }
                _ => Some((*hash, cumulative)),
            };
        }
        if let Some((hash, _)) = best {
            self.tip = Some(hash);
            if let Some(snapshot) = self.account_snapshots.get(&hash) {
                self.accounts = snapshot.clone();
            }
        }
    }

    fn is_root_ancestor(&self, candidate: &Hash, tip: &Hash) -> bool {
        let mut cur = *tip;
        loop {
            if cur == *candidate {
                return true;
            }
            match self.root_parents.get(&cur) {
                Some(parent) if *parent != cur => cur = *parent,
                _ => return false,
            }
        }
    }

    /// Deposits a cross-shard list from a neighbor shard's outbox into this
    /// shard's pending inbox, to be applied once the source block's
    /// containing root block is confirmed.
    pub fn handle_xshard_tx_list(&mut self, list: CrossShardTxList) {
        if self.applied_sources.contains(&list.minor_block_hash) {
            return;
        }
        self.pending_inbox.insert(list.minor_block_hash, list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusType, GenesisConfig};
    use crate::consensus::NoneEngine;
    use crate::evm::SimpleExecutionEngine;

    fn make_shard(chain_id: u16, shard_size: u16, shard_id: u16) -> ShardState {
        let cfg = ShardConfig {
            chain_id,
            shard_size,
            shard_id,
            consensus_type: ConsensusType::None,
            pow_config: None,
            coinbase_address: Address::new([9u8; 20], 0),
            genesis: GenesisConfig::default(),
            target_block_time_sec: 10,
            max_tx_pool_size: 100,
        };
        ShardState::new(cfg, Box::new(NoneEngine), Box::new(SimpleExecutionEngine))
    }

    #[test]
    fn genesis_creation_seeds_alloc() {
        let mut shard = make_shard(0, 2, 0);
        let addr = Address::new([1u8; 20], shard.full_shard_id().raw());
        shard
            .config
            .genesis
            .alloc
            .insert(hex::encode(addr.recipient), 1_000_000);
        shard.create_genesis([0xAAu8; 32], 1).unwrap();
        assert_eq!(shard.get_balance(&addr), 1_000_000);
        assert!(shard.has_genesis());
    }

    #[test]
    fn double_add_block_is_noop() {
        let mut shard = make_shard(0, 2, 0);
        shard.create_genesis([0xAAu8; 32], 1).unwrap();
        let block = shard.create_block_to_mine(Address::new([2u8; 20], 0)).unwrap();
        shard.add_block(block.clone()).unwrap();
        let tip_before = shard.tip_hash();
        shard.add_block(block).unwrap();
        assert_eq!(shard.tip_hash(), tip_before);
    }

    #[test]
    fn mempool_rejects_when_full() {
        let mut shard = make_shard(0, 2, 0);
        shard.create_genesis([0xAAu8; 32], 1).unwrap();
        shard.config.max_tx_pool_size = 0;
        let from = Address::new([3u8; 20], 0);
        let tx = Transaction::unsigned(from, Address::new([4u8; 20], 1), 1, 21000, 0, 1);
        assert!(shard.add_transaction(tx).is_err());
    }
}
