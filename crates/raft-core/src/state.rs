//! # state
//!
//! why: name the state that crosses the core's boundary
//! relations: HardState is encoded by raft-storage, ApplyMsg is delivered by raft-node
//! what: HardState (durable fields), ApplyMsg (commit stream items)

use crate::LogEntry;
use serde::{Deserialize, Serialize};

/// the minimal fields a node needs to resume correctly after a crash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub last_snapshot_include_index: u64,
    pub last_snapshot_include_term: u64,
    /// entries after the snapshot boundary
    pub logs: Vec<LogEntry>,
}

/// one item of the commit stream handed to the application, in commit order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// a committed command
    Command { index: u64, term: u64, command: Vec<u8> },
    /// a snapshot the application must load in place of its current state
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

impl ApplyMsg {
    /// log index this message brings the application up to
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}
