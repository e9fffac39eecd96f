//! Transactions, minor blocks, root blocks, and the cross-shard artifacts
//! extracted from them.

use crate::types::{Address, Difficulty, FullShardId, Hash};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

pub type TransactionSignature = Vec<u8>;
pub type PublicKey = Vec<u8>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub value: u128,
    pub gas: u64,
    pub gas_price: u64,
    pub nonce: u64,
    pub hash: Hash,
    /// Ed25519 signature (64 bytes); empty only for system/genesis transactions.
    pub signature: TransactionSignature,
    pub public_key: PublicKey,
}

impl Transaction {
    pub fn unsigned(from: Address, to: Address, value: u128, gas: u64, nonce: u64, gas_price: u64) -> Self {
        let mut tx = Self {
            from,
            to,
            value,
            gas,
            gas_price,
            nonce,
            hash: [0u8; 32],
            signature: Vec::new(),
            public_key: Vec::new(),
        };
        tx.hash = tx.calculate_hash();
        tx
    }

    pub fn sign(mut self, secret_key: &[u8; 32]) -> Self {
        use ed25519_dalek::{Signer, SigningKey};
        let signing_key = SigningKey::from_bytes(secret_key);
        let verifying_key = signing_key.verifying_key();
        self.public_key = verifying_key.to_bytes().to_vec();
        let signature = signing_key.sign(&self.hash);
        self.signature = signature.to_bytes().to_vec();
        self
    }

    pub fn verify_signature(&self) -> bool {
        if self.signature.is_empty() && self.public_key.is_empty() {
            return self.from.recipient == [0u8; 20];
        }
        if self.signature.len() != 64 || self.public_key.len() != 32 {
            return false;
        }
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};
        let pub_bytes: [u8; 32] = match self.public_key.as_slice().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let verifying_key = match VerifyingKey::from_bytes(&pub_bytes) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let sig_bytes: [u8; 64] = match self.signature.as_slice().try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let signature = match Signature::try_from(&sig_bytes[..]) {
            Ok(s) => s,
            Err(_) => return false,
        };
        verifying_key.verify(&self.hash, &signature).is_ok()
    }

    pub fn calculate_hash(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(self.from.recipient);
        hasher.update(self.from.full_shard_key.to_be_bytes());
        hasher.update(self.to.recipient);
        hasher.update(self.to.full_shard_key.to_be_bytes());
        hasher.update(self.value.to_be_bytes());
        hasher.update(self.gas.to_be_bytes());
        hasher.update(self.gas_price.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinorBlockHeader {
    pub branch: FullShardId,
    pub height: u64,
    pub hash_prev_minor_block: Hash,
    pub hash_prev_root_block: Hash,
    pub tx_merkle_root: Hash,
    pub timestamp: u64,
    pub difficulty: Difficulty,
    pub nonce: u64,
    pub coinbase_address: Address,
    pub coinbase_amount: u128,
}

impl MinorBlockHeader {
    pub fn hash(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(self.branch.raw().to_be_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.hash_prev_minor_block);
        hasher.update(self.hash_prev_root_block);
        hasher.update(self.tx_merkle_root);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinorBlock {
    pub header: MinorBlockHeader,
    pub transactions: Vec<Transaction>,
}

impl MinorBlock {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn merkle_root(transactions: &[Transaction]) -> Hash {
        merkle_root(transactions.iter().map(|t| t.hash).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootBlockHeader {
    pub height: u64,
    pub hash_prev_root_block: Hash,
    pub minor_header_merkle_root: Hash,
    pub timestamp: u64,
    pub difficulty: Difficulty,
    pub nonce: u64,
    pub coinbase_address: Address,
    pub coinbase_amount: u128,
}

impl RootBlockHeader {
    pub fn hash(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.hash_prev_root_block);
        hasher.update(self.minor_header_merkle_root);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootBlock {
    pub header: RootBlockHeader,
    pub minor_block_headers: Vec<MinorBlockHeader>,
}

impl RootBlock {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn minor_header_merkle_root(headers: &[MinorBlockHeader]) -> Hash {
        merkle_root(headers.iter().map(|h| h.hash()).collect())
    }
}

/// A single cross-shard deposit extracted from a minor block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossShardDeposit {
    pub tx_hash: Hash,
    pub from: Address,
    pub to: Address,
    pub value: u128,
}

/// All cross-shard outputs extracted from one minor block, keyed by that
/// minor block's hash; delivered verbatim to each destination-shard
/// neighbor's inbox.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrossShardTxList {
    pub minor_block_hash: Hash,
    pub deposits: Vec<CrossShardDeposit>,
}

fn merkle_root(mut layer: Vec<Hash>) -> Hash {
    if layer.is_empty() {
        return [0u8; 32];
    }
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            layer.push(*layer.last().unwrap());
        }
        layer = layer
            .chunks(2)
            .map(|pair| {
                let mut hasher = Keccak256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8, key: u32) -> Address {
        Address::new([b; 20], key)
    }

    #[test]
    fn transaction_hash_is_deterministic() {
        let tx1 = Transaction::unsigned(addr(1, 0), addr(2, 1), 100, 21000, 0, 1);
        let tx2 = Transaction::unsigned(addr(1, 0), addr(2, 1), 100, 21000, 0, 1);
        assert_eq!(tx1.hash, tx2.hash);
    }

    #[test]
    fn signed_transaction_verifies() {
        let key = [7u8; 32];
        let tx = Transaction::unsigned(addr(1, 0), addr(2, 1), 100, 21000, 0, 1).sign(&key);
        assert!(tx.verify_signature());
    }

    #[test]
    fn merkle_root_single_leaf_is_its_own_hash() {
        let h = [9u8; 32];
        assert_eq!(merkle_root(vec![h]), h);
    }

    #[test]
    fn merkle_root_empty_is_zero() {
        assert_eq!(merkle_root(vec![]), [0u8; 32]);
    }
}
