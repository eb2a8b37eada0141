use raft_core::{ConfigError, CoreError};
use raft_storage::StorageError;
use thiserror::Error;

/// errors returned by a running node
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("persistence failure: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    /// the node stopped after a persistence failure or kill()
    #[error("node {0} has halted")]
    Halted(u64),
}

/// why an outbound rpc produced no reply
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(u64),

    #[error("rpc to peer {0} timed out")]
    Timeout(u64),

    #[error("peer {0} answered with an unexpected message kind")]
    UnexpectedReply(u64),

    #[error("wire codec: {0}")]
    Codec(#[from] CoreError),
}
