//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-node (timers, transport, locking), persisted via raft-storage
//! what: state machine, election logic, replication, snapshots, log management, message types

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use config::RaftConfig;
pub use error::{ConfigError, CoreError};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    NetworkState, RaftMessage, RequestVoteArgs, RequestVoteReply, VoteOutcome,
};
pub use node::{NodeState, RaftNode, Replication};
pub use state::{ApplyMsg, HardState};
