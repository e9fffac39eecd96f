//! Pluggable consensus engines.
//!
//! `ConsensusType` selects an implementation at config-load time; callers
//! (`ShardState`, `RootState`) hold a `Box<dyn ConsensusEngine>` and never
//! match on the variant themselves, so the root-chain-first reorg logic is
//! identical regardless of which PoW family seals a chain's blocks.

use crate::config::{ConsensusType, PowConfig};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{Difficulty, Hash};
use sha3::{Digest, Keccak256};

/// A block header's seal-relevant fields, abstracted away from whether the
/// header belongs to a root block or a minor block.
pub struct SealableHeader<'a> {
    pub hash_without_nonce: &'a [u8],
    pub nonce: u64,
    pub difficulty: Difficulty,
}

pub trait ConsensusEngine: Send + Sync {
    /// Verifies that a header's nonce satisfies its declared difficulty.
    fn verify_seal(&self, header: &SealableHeader<'_>) -> ClusterResult<()>;

    /// Computes the next block's required difficulty given the parent's
    /// difficulty and the observed inter-block time.
    fn next_difficulty(&self, parent_difficulty: Difficulty, interval_sec: u64) -> Difficulty;
}

/// No PoW requirement at all; every header is trivially sealed. Used for
/// deterministic tests and local development clusters.
pub struct NoneEngine;

impl ConsensusEngine for NoneEngine {
    fn verify_seal(&self, _header: &SealableHeader<'_>) -> ClusterResult<()> {
        Ok(())
    }

    fn next_difficulty(&self, parent_difficulty: Difficulty, _interval_sec: u64) -> Difficulty {
        parent_difficulty.max(1)
    }
}

/// Deterministic stand-in for a real PoW: accepts any nonce, but still
/// derives difficulty from target block time, so tip-selection tests that
/// depend on cumulative difficulty exercise real arithmetic.
pub struct SimulateEngine {
    pub pow: PowConfig,
}

impl ConsensusEngine for SimulateEngine {
    fn verify_seal(&self, _header: &SealableHeader<'_>) -> ClusterResult<()> {
        Ok(())
    }

    fn next_difficulty(&self, parent_difficulty: Difficulty, interval_sec: u64) -> Difficulty {
        adjust_difficulty(parent_difficulty, interval_sec, &self.pow)
    }
}

/// Ethash-style engine: checks that `keccak256(hash_without_nonce || nonce)`
/// is below a target derived from difficulty. This is a simplified stand-in
/// (no DAG, no mix-hash) since the real PoW algorithm is an external
/// collaborator per scope.
pub struct EthashLikeEngine {
    pub pow: PowConfig,
}

impl ConsensusEngine for EthashLikeEngine {
    fn verify_seal(&self, header: &SealableHeader<'_>) -> ClusterResult<()> {
        let mut hasher = Keccak256::new();
        hasher.update(header.hash_without_nonce);
        hasher.update(header.nonce.to_be_bytes());
        let digest: Hash = hasher.finalize().into();
        if !below_target(&digest, header.difficulty) {
            return Err(ClusterError::InvalidBlock(
                "seal hash does not meet declared difficulty".into(),
            ));
        }
        Ok(())
    }

    fn next_difficulty(&self, parent_difficulty: Difficulty, interval_sec: u64) -> Difficulty {
        adjust_difficulty(parent_difficulty, interval_sec, &self.pow)
    }
}

pub struct DoubleSha256Engine {
    pub pow: PowConfig,
}

impl ConsensusEngine for DoubleSha256Engine {
    fn verify_seal(&self, header: &SealableHeader<'_>) -> ClusterResult<()> {
        let mut hasher = Keccak256::new();
        hasher.update(header.hash_without_nonce);
        hasher.update(header.nonce.to_be_bytes());
        let first: Hash = hasher.finalize().into();
        let digest: Hash = Keccak256::digest(first).into();
        if !below_target(&digest, header.difficulty) {
            return Err(ClusterError::InvalidBlock(
                "seal hash does not meet declared difficulty".into(),
            ));
        }
        Ok(())
    }

    fn next_difficulty(&self, parent_difficulty: Difficulty, interval_sec: u64) -> Difficulty {
        adjust_difficulty(parent_difficulty, interval_sec, &self.pow)
    }
}

fn below_target(digest: &Hash, difficulty: Difficulty) -> bool {
    if difficulty == 0 {
        return true;
    }
    let leading = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    leading < u64::MAX / difficulty.max(1)
}

fn adjust_difficulty(parent_difficulty: Difficulty, interval_sec: u64, pow: &PowConfig) -> Difficulty {
    if interval_sec < pow.difficulty_adjustment_cutoff_time_sec {
        parent_difficulty
            .saturating_add(parent_difficulty / pow.difficulty_adjustment_factor.max(1))
            .max(1)
    } else {
        parent_difficulty
            .saturating_sub(parent_difficulty / pow.difficulty_adjustment_factor.max(1))
            .max(1)
    }
}

pub fn engine_for(consensus_type: ConsensusType, pow: Option<PowConfig>) -> Box<dyn ConsensusEngine> {
    let pow = pow.unwrap_or_default();
    match consensus_type {
        ConsensusType::None => Box::new(NoneEngine),
        ConsensusType::Simulate => Box::new(SimulateEngine { pow }),
        ConsensusType::Ethash | ConsensusType::QkcHash => Box::new(EthashLikeEngine { pow }),
        ConsensusType::DoubleSha256 => Box::new(DoubleSha256Engine { pow }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_engine_accepts_everything() {
        let engine = NoneEngine;
        let header = SealableHeader {
            hash_without_nonce: b"whatever",
            nonce: 0,
            difficulty: 1_000_000,
        };
        assert!(engine.verify_seal(&header).is_ok());
    }

    #[test]
    fn difficulty_rises_when_blocks_come_fast() {
        let pow = PowConfig::default();
        let slow = adjust_difficulty(1000, 100, &pow);
        let fast = adjust_difficulty(1000, 1, &pow);
        assert!(fast > slow);
    }
}
