//! Error taxonomy for the cluster core.
//!
//! Every fallible operation in this crate returns `ClusterResult<T>`. The
//! variants below carry distinct propagation policy (see each operation's
//! call sites): validation errors stay local, `RpcTimeout`/`PeerClosed` are
//! transient and left to the caller, `IntegrityError` is fatal.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid transaction: {0}")]
    InvalidTx(String),

    #[error("unknown ancestor: {0}")]
    UnknownAncestor(String),

    #[error("stale block: {0}")]
    StaleBlock(String),

    #[error("peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    #[error("rpc timed out: {0}")]
    RpcTimeout(String),

    #[error("peer connection closed: {0}")]
    PeerClosed(String),

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Exit code the binary entrypoint uses when it aborts on a fatal error.
/// Distinct from 1 (generic failure) so an operator's process supervisor can
/// tell "crashed" apart from "detected corrupted/fabricated chain data".
pub const FATAL_EXIT_CODE: i32 = 70;

impl ClusterError {
    /// `IntegrityError` is the only variant the binary entrypoint treats as
    /// fatal (process abort with a distinct exit code); everything else is
    /// either rejected locally or bubbled to a caller that decides policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::IntegrityError(_))
    }

    /// Logs and aborts the process if `self` is fatal; otherwise a no-op.
    /// Called at every surface that lets chain data from outside this
    /// process reach `Master` (JSON-RPC, peer sync).
    pub fn abort_if_fatal(&self) {
        if self.is_fatal() {
            tracing::error!(error = %self, "integrity violation detected, aborting process");
            std::process::exit(FATAL_EXIT_CODE);
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Io(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
