//! Per-peer, per-chain sync state machine: `Idle -> Pulling -> Validating
//! -> Idle`, with backoff on repeated failure so one stuck peer doesn't spin
//! the task.

use crate::types::FullShardId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pulling,
    Validating,
}

struct ChainSync {
    state: SyncState,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl Default for ChainSync {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            consecutive_failures: 0,
            backoff_until: None,
        }
    }
}

/// One of these per connected peer; tracks sync progress independently for
/// the root chain (`None`) and each shard the peer has announced headers
/// for.
#[derive(Default)]
pub struct PeerSynchronizer {
    root: ChainSync,
    shards: HashMap<FullShardId, ChainSync>,
}

const MAX_BACKOFF_SEC: u64 = 60;

impl PeerSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_state(&self) -> SyncState {
        self.root.state
    }

    pub fn shard_state(&self, branch: FullShardId) -> SyncState {
        self.shards.get(&branch).map(|c| c.state).unwrap_or(SyncState::Idle)
    }

    /// Whether this chain is currently in backoff and should not be pulled
    /// from yet.
    pub fn is_backed_off_root(&self) -> bool {
        is_backed_off(&self.root)
    }

    pub fn is_backed_off_shard(&self, branch: FullShardId) -> bool {
        self.shards.get(&branch).map(is_backed_off).unwrap_or(false)
    }

    pub fn start_pulling_root(&mut self) -> bool {
        if self.root.state != SyncState::Idle || is_backed_off(&self.root) {
            return false;
        }
        self.root.state = SyncState::Pulling;
        true
    }

    pub fn start_pulling_shard(&mut self, branch: FullShardId) -> bool {
        let entry = self.shards.entry(branch).or_default();
        if entry.state != SyncState::Idle || is_backed_off(entry) {
            return false;
        }
        entry.state = SyncState::Pulling;
        true
    }

    pub fn begin_validating_root(&mut self) {
        self.root.state = SyncState::Validating;
    }

    pub fn begin_validating_shard(&mut self, branch: FullShardId) {
        self.shards.entry(branch).or_default().state = SyncState::Validating;
    }

    pub fn succeed_root(&mut self) {
        self.root.state = SyncState::Idle;
        self.root.consecutive_failures = 0;
        self.root.backoff_until = None;
    }

    pub fn succeed_shard(&mut self, branch: FullShardId) {
        let entry = self.shards.entry(branch).or_default();
        entry.state = SyncState::Idle;
        entry.consecutive_failures = 0;
        entry.backoff_until = None;
    }

    pub fn fail_root(&mut self) {
        fail(&mut self.root);
    }

    pub fn fail_shard(&mut self, branch: FullShardId) {
        fail(self.shards.entry(branch).or_default());
    }
}

fn is_backed_off(sync: &ChainSync) -> bool {
    sync.backoff_until.map(|until| Instant::now() < until).unwrap_or(false)
}

fn fail(sync: &mut ChainSync) {
    sync.state = SyncState::Idle;
    sync.consecutive_failures += 1;
    let backoff_sec = (1u64 << sync.consecutive_failures.min(6)).min(MAX_BACKOFF_SEC);
    sync.backoff_until = Some(Instant::now() + Duration::from_secs(backoff_sec));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sync_cycles_idle_pulling_validating_idle() {
        let mut sync = PeerSynchronizer::new();
        assert_eq!(sync.root_state(), SyncState::Idle);
        assert!(sync.start_pulling_root());
        assert_eq!(sync.root_state(), SyncState::Pulling);
        sync.begin_validating_root();
        assert_eq!(sync.root_state(), SyncState::Validating);
        sync.succeed_root();
        assert_eq!(sync.root_state(), SyncState::Idle);
    }

    #[test]
    fn repeated_failure_backs_off() {
        let mut sync = PeerSynchronizer::new();
        sync.start_pulling_root();
        sync.fail_root();
        assert!(sync.is_backed_off_root());
        assert!(!sync.start_pulling_root());
    }

    #[test]
    fn shard_sync_is_independent_per_branch() {
        let mut sync = PeerSynchronizer::new();
        let a = FullShardId::new(0, 2, 0);
        let b = FullShardId::new(0, 2, 1);
        sync.start_pulling_shard(a);
        assert_eq!(sync.shard_state(a), SyncState::Pulling);
        assert_eq!(sync.shard_state(b), SyncState::Idle);
    }
}
