//! # error
//!
//! why: name the recoverable failures of the protocol core
//! relations: returned by log.rs (restore), message.rs (wire codec), config.rs
//! what: CoreError, ConfigError

use thiserror::Error;

/// errors raised while rebuilding or (de)serializing core state
#[derive(Debug, Error)]
pub enum CoreError {
    /// a restored log is not gap-free after the snapshot boundary
    #[error("corrupt log: expected index {expected}, found {found}")]
    CorruptLog { expected: u64, found: u64 },

    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
}

/// invalid timing configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("election_timeout_min ({min}) exceeds election_timeout_max ({max})")]
    InvertedElectionWindow { min: u64, max: u64 },

    #[error("heartbeat_interval ({heartbeat}) must be below election_timeout_min ({election_min})")]
    HeartbeatTooSlow { heartbeat: u64, election_min: u64 },

    #[error("malformed config: {0}")]
    Malformed(String),
}
