//! # network
//!
//! why: let several nodes talk inside one process, with controllable partitions
//! relations: implements transport.rs for raft.rs, used by the cluster tests and local demos
//! what: LocalNetwork registry, per-node LocalTransport, disconnect/connect, delivery jitter
//!
//! every request and reply is encoded with the raft-core wire codec and decoded on
//! the other side, so messages cross exactly the bytes a real transport would carry.

use crate::{Raft, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RaftMessage, RequestVoteArgs, RequestVoteReply,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// in-process router between registered nodes
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<RwLock<Routes>>,
}

#[derive(Default)]
struct Routes {
    nodes: HashMap<u64, Raft>,
    disconnected: HashSet<u64>,
    /// upper bound of the random delay added to each hop, in ms
    max_jitter: u64,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// delay every hop by a random 0..=max_ms, so concurrent rpcs can overtake each other
    pub fn with_jitter(max_ms: u64) -> Self {
        let network = Self::default();
        network.routes.write().max_jitter = max_ms;
        network
    }

    /// outbound transport for node `from`
    pub fn transport(&self, from: u64) -> Arc<dyn Transport> {
        Arc::new(LocalTransport { from, network: self.clone() })
    }

    /// make a node reachable under its id (replacing any previous incarnation)
    pub fn register(&self, raft: Raft) {
        self.routes.write().nodes.insert(raft.id(), raft);
    }

    /// forget a node, e.g. after a simulated crash
    pub fn remove(&self, id: u64) -> Option<Raft> {
        self.routes.write().nodes.remove(&id)
    }

    /// cut every link to and from `id`
    pub fn disconnect(&self, id: u64) {
        self.routes.write().disconnected.insert(id);
    }

    pub fn connect(&self, id: u64) {
        self.routes.write().disconnected.remove(&id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        !self.routes.read().disconnected.contains(&id)
    }

    fn route(&self, from: u64, to: u64) -> Result<Raft, TransportError> {
        let routes = self.routes.read();
        if routes.disconnected.contains(&from) || routes.disconnected.contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        if !routes.nodes.contains_key(&from) {
            return Err(TransportError::Unreachable(to));
        }
        routes.nodes.get(&to).cloned().ok_or(TransportError::Unreachable(to))
    }

    async fn jitter(&self) {
        let max = self.routes.read().max_jitter;
        if max == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=max);
        sleep(Duration::from_millis(ms)).await;
    }
}

struct LocalTransport {
    from: u64,
    network: LocalNetwork,
}

impl LocalTransport {
    /// carry `request` to `to` and its reply back; either hop can be cut by a partition
    async fn deliver(&self, to: u64, request: RaftMessage) -> Result<RaftMessage, TransportError> {
        let wire = request.encode()?;
        self.network.jitter().await;
        let target = self.network.route(self.from, to)?;

        let reply = match RaftMessage::decode(&wire)? {
            RaftMessage::RequestVote(args) => {
                RaftMessage::RequestVoteReply(target.handle_request_vote(args))
            }
            RaftMessage::AppendEntries(args) => {
                RaftMessage::AppendEntriesReply(target.handle_append_entries(args))
            }
            RaftMessage::InstallSnapshot(args) => {
                let reply = target
                    .handle_install_snapshot(args)
                    .map_err(|_| TransportError::Unreachable(to))?;
                RaftMessage::InstallSnapshotReply(reply)
            }
            _ => return Err(TransportError::UnexpectedReply(to)),
        };
        drop(target);

        let wire = reply.encode()?;
        self.network.jitter().await;
        self.network.route(to, self.from)?;
        Ok(RaftMessage::decode(&wire)?)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        match self.deliver(target, RaftMessage::RequestVote(args)).await? {
            RaftMessage::RequestVoteReply(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply(target)),
        }
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        match self.deliver(target, RaftMessage::AppendEntries(args)).await? {
            RaftMessage::AppendEntriesReply(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply(target)),
        }
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError> {
        match self.deliver(target, RaftMessage::InstallSnapshot(args)).await? {
            RaftMessage::InstallSnapshotReply(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply(target)),
        }
    }
}
