//! Core wire/storage types: shard topology and addressing.

use serde::{Deserialize, Serialize};

/// A 32-byte content hash (Keccak256 of the canonical encoding).
pub type Hash = [u8; 32];

/// Cumulative or per-block difficulty.
pub type Difficulty = u64;

/// `(chain_id << 16) | shard_size | shard_id`.
///
/// `shard_size` is a power of two and occupies a single bit of the low 16
/// bits; `shard_id` occupies the strictly lower bits, so the two halves never
/// collide under bitwise OR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullShardId(pub u32);

impl FullShardId {
    pub fn new(chain_id: u16, shard_size: u16, shard_id: u16) -> Self {
        debug_assert!(shard_size.is_power_of_two());
        debug_assert!(shard_id < shard_size);
        FullShardId(((chain_id as u32) << 16) | (shard_size as u32) | (shard_id as u32))
    }

    pub fn chain_id(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The power-of-two shard count for this shard's chain, recovered as the
    /// highest set bit of the low 16 bits.
    pub fn shard_size(&self) -> u16 {
        let low = (self.0 & 0xFFFF) as u16;
        if low == 0 {
            return 1;
        }
        1u16 << (15 - low.leading_zeros() as u16)
    }

    pub fn shard_id(&self) -> u16 {
        let low = (self.0 & 0xFFFF) as u16;
        low & !self.shard_size()
    }

    /// Two shards are neighbors iff they belong to the same chain and their
    /// shard_ids differ in exactly one bit.
    pub fn is_neighbor_of(&self, other: &FullShardId) -> bool {
        if self.chain_id() != other.chain_id() {
            return false;
        }
        if self.shard_size() != other.shard_size() {
            return false;
        }
        (self.shard_id() ^ other.shard_id()).count_ones() == 1
    }

    /// All neighbor shard ids reachable from this shard (log2(shard_size) of
    /// them), within the same chain.
    pub fn neighbors(&self) -> Vec<FullShardId> {
        let size = self.shard_size();
        let chain = self.chain_id();
        let mut out = Vec::new();
        let mut bit = 1u16;
        while bit < size {
            out.push(FullShardId::new(chain, size, self.shard_id() ^ bit));
            bit <<= 1;
        }
        out
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for FullShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.shard_size(), self.shard_id())
    }
}

/// A 20-byte recipient plus a 4-byte full-shard-key used to route the
/// address to a specific shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub recipient: [u8; 20],
    pub full_shard_key: u32,
}

impl Address {
    pub fn new(recipient: [u8; 20], full_shard_key: u32) -> Self {
        Self {
            recipient,
            full_shard_key,
        }
    }

    /// The shard id this address belongs to within a chain of the given
    /// `shard_size`, obtained by masking the low bits of the full-shard-key.
    pub fn shard_id(&self, shard_size: u16) -> u16 {
        (self.full_shard_key as u16) & (shard_size - 1)
    }

    /// The full shard id this address belongs to, given the target chain's
    /// `chain_id`/`shard_size`.
    pub fn full_shard_id(&self, chain_id: u16, shard_size: u16) -> FullShardId {
        FullShardId::new(chain_id, shard_size, self.shard_id(shard_size))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.recipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_shard_id_roundtrip() {
        let f = FullShardId::new(3, 64, 17);
        assert_eq!(f.chain_id(), 3);
        assert_eq!(f.shard_size(), 64);
        assert_eq!(f.shard_id(), 17);
    }

    #[test]
    fn neighbor_predicate_matches_single_bit_difference() {
        let a = FullShardId::new(0, 64, 0);
        let b = FullShardId::new(0, 64, 1);
        let c = FullShardId::new(0, 64, 3);
        assert!(a.is_neighbor_of(&b));
        assert!(!a.is_neighbor_of(&c));
    }

    #[test]
    fn neighbors_of_shard_zero_in_64_are_six_power_of_two_ids() {
        let a = FullShardId::new(0, 64, 0);
        let mut ids: Vec<u16> = a.neighbors().iter().map(|n| n.shard_id()).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn neighbor_not_symmetric_across_chains() {
        let a = FullShardId::new(0, 64, 0);
        let b = FullShardId::new(1, 64, 1);
        assert!(!a.is_neighbor_of(&b));
    }
}
