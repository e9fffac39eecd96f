//! sled-backed persistence, one `Database` per process with a tree per
//! concern: minor blocks/headers/account state/cross-shard inbox are scoped
//! per shard by prefixing keys with the shard's `FullShardId`; root blocks
//! and the minor-header index live in their own trees.

use crate::block::{CrossShardTxList, MinorBlock, RootBlock};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{Address, FullShardId, Hash};
use sled::Db;
use std::path::Path;

pub struct Database {
    db: Db,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let db = sled::open(path).map_err(|e| ClusterError::Storage(format!("failed to open database: {e}")))?;
        Ok(Self { db })
    }

    fn tree(&self, name: &str) -> ClusterResult<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| ClusterError::Storage(format!("failed to open tree {name}: {e}")))
    }
}

fn shard_key(branch: FullShardId, suffix: &[u8]) -> Vec<u8> {
    let mut key = branch.raw().to_be_bytes().to_vec();
    key.extend_from_slice(suffix);
    key
}

/// Minor blocks and headers for one shard, namespaced by `FullShardId`. Owns
/// cloned `sled::Tree` handles rather than borrowing `Database`, so a
/// `Slave` can hold one of these per owned shard alongside its `ShardState`s
/// without fighting the borrow checker.
#[derive(Clone)]
pub struct MinorBlockStore {
    blocks: sled::Tree,
    inbox: sled::Tree,
    accounts: sled::Tree,
    branch: FullShardId,
}

impl MinorBlockStore {
    pub fn new(db: &Database, branch: FullShardId) -> ClusterResult<Self> {
        Ok(Self {
            blocks: db.tree("minor_blocks")?,
            inbox: db.tree("xshard_inbox")?,
            accounts: db.tree("account_state")?,
            branch,
        })
    }

    pub fn put_block(&self, block: &MinorBlock) -> ClusterResult<()> {
        let key = shard_key(self.branch, &block.hash());
        let value = bincode::serialize(block)?;
        self.blocks.insert(key, value).map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> ClusterResult<Option<MinorBlock>> {
        let key = shard_key(self.branch, hash);
        match self.blocks.get(key).map_err(|e| ClusterError::Storage(e.to_string()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_pending_xshard_list(&self, source_hash: &Hash, list: &CrossShardTxList) -> ClusterResult<()> {
        let key = shard_key(self.branch, source_hash);
        let value = bincode::serialize(list)?;
        self.inbox.insert(key, value).map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn take_pending_xshard_list(&self, source_hash: &Hash) -> ClusterResult<Option<CrossShardTxList>> {
        let key = shard_key(self.branch, source_hash);
        match self.inbox.remove(key).map_err(|e| ClusterError::Storage(e.to_string()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_account_balance(&self, address: &Address, balance: u128) -> ClusterResult<()> {
        let key = shard_key(self.branch, &address.recipient);
        self.accounts
            .insert(key, balance.to_be_bytes().to_vec())
            .map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_account_balance(&self, address: &Address) -> ClusterResult<Option<u128>> {
        let key = shard_key(self.branch, &address.recipient);
        match self.accounts.get(key).map_err(|e| ClusterError::Storage(e.to_string()))? {
            Some(bytes) if bytes.len() == 16 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(&bytes);
                Ok(Some(u128::from_be_bytes(buf)))
            }
            _ => Ok(None),
        }
    }
}

/// Root blocks and the minor-header-hash -> root-block-hash index.
#[derive(Clone)]
pub struct RootBlockStore {
    blocks: sled::Tree,
    minor_header_index: sled::Tree,
}

impl RootBlockStore {
    pub fn new(db: &Database) -> ClusterResult<Self> {
        Ok(Self {
            blocks: db.tree("root_blocks")?,
            minor_header_index: db.tree("minor_header_index")?,
        })
    }

    pub fn put_block(&self, block: &RootBlock) -> ClusterResult<()> {
        let value = bincode::serialize(block)?;
        self.blocks.insert(block.hash(), value).map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> ClusterResult<Option<RootBlock>> {
        match self.blocks.get(hash).map_err(|e| ClusterError::Storage(e.to_string()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn index_minor_header(&self, minor_header_hash: &Hash, root_block_hash: &Hash) -> ClusterResult<()> {
        self.minor_header_index
            .insert(minor_header_hash, root_block_hash.to_vec())
            .map_err(|e| ClusterError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn containing_root_block(&self, minor_header_hash: &Hash) -> ClusterResult<Option<Hash>> {
        match self
            .minor_header_index
            .get(minor_header_hash)
            .map_err(|e| ClusterError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(&bytes);
                Ok(Some(buf))
            }
            _ => Ok(None),
        }
    }
}
