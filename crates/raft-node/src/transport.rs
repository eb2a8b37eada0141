//! # transport
//!
//! why: keep the node independent of how rpcs travel between peers
//! relations: implemented by network.rs (in-process) or a host's real rpc layer, called by raft.rs
//! what: the async Transport trait, one method per raft rpc

use crate::TransportError;
use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

/// outbound rpc channel of one node; `target` is the peer's node id.
/// a failed or lost call is reported as an error and treated as "no information".
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError>;
}
