//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: built and consumed by node.rs, carried by raft-node transports
//! what: RequestVote, AppendEntries, InstallSnapshot request/reply pairs and a versioned wire envelope

use crate::error::CoreError;
use crate::LogEntry;
use serde::{Deserialize, Serialize};

/// version stamped on every encoded message
pub const WIRE_VERSION: u16 = 1;

/// Why a vote was granted or refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOutcome {
    Granted,
    /// voter already gave its vote to another candidate this term
    AlreadyVoted,
    /// candidate's term is behind the voter's
    StaleTerm,
    /// candidate's log is less up-to-date than the voter's
    LogBehind,
    /// voter has halted and is not participating
    Killed,
}

/// Whether a reply carries information from a live peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Normal,
    Disconnected,
}

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub vote_outcome: VoteOutcome,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// on failure, the index the leader should retry from (0 when the leader is stale)
    pub update_next_index: u64,
    pub network_state: NetworkState,
}

/// Ship a whole snapshot to a follower that fell behind the leader's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_include_index: u64,
    pub last_include_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotArgs),
    InstallSnapshotReply(InstallSnapshotReply),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    message: RaftMessage,
}

impl RaftMessage {
    /// serialize into the versioned wire format
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        #[derive(Serialize)]
        struct EnvelopeRef<'a> {
            version: u16,
            message: &'a RaftMessage,
        }
        Ok(serde_json::to_vec(&EnvelopeRef { version: WIRE_VERSION, message: self })?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.version != WIRE_VERSION {
            return Err(CoreError::UnsupportedVersion {
                found: envelope.version,
                expected: WIRE_VERSION,
            });
        }
        Ok(envelope.message)
    }

    /// term carried by the message, whichever kind it is
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteReply(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesReply(m) => m.term,
            RaftMessage::InstallSnapshot(m) => m.term,
            RaftMessage::InstallSnapshotReply(m) => m.term,
        }
    }
}
