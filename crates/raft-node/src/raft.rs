//! # raft
//!
//! why: turn the synchronous raft-core state machine into a running cluster member
//! relations: owns a RaftNode and a Storage behind one mutex, sends through a Transport,
//!            feeds the application through an mpsc channel
//! what: Raft handle, inbound rpc handlers, client calls, election/heartbeat/apply tickers
//!
//! every read or write of node state happens under `Shared::inner`. the lock is
//! never held across an await: rpc arguments are built under it, sent without it,
//! and replies are reconciled under it again.

use crate::{RaftError, Transport, TransportError};
use parking_lot::Mutex;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, HardState, InstallSnapshotArgs,
    InstallSnapshotReply, NetworkState, NodeState, RaftConfig, RaftNode, Replication,
    RequestVoteArgs, RequestVoteReply, VoteOutcome,
};
use raft_storage::Storage;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Handle to one running raft node. Cheap to clone.
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    peers: Vec<u64>,
    config: RaftConfig,
    inner: Mutex<Inner>,
    transport: Arc<dyn Transport>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    killed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    node: RaftNode,
    storage: Box<dyn Storage>,
    /// last hard state known to be on disk
    persisted: HardState,
    /// snapshot bytes that must be written together with the next hard state
    pending_snapshot: Option<Vec<u8>>,
    last_reset_election: Instant,
    last_reset_heartbeat: Instant,
    halted: bool,
}

/// an rpc built under the lock, ready to send
enum Outbound {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

impl Raft {
    /// restore persisted state and start the background tickers.
    ///
    /// `cluster` lists every member, this node included. committed entries and
    /// installed snapshots are delivered on `apply_tx` in commit order. must be
    /// called from within a tokio runtime.
    pub fn launch(
        id: u64,
        cluster: Vec<u64>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        let mut node = RaftNode::with_config(id, cluster.clone(), config.clone());
        if let Some(hard) = storage.load_hard_state()? {
            let snapshot = storage.read_snapshot()?;
            node.restore(hard, snapshot)?;
            info!(
                node_id = id,
                term = node.current_term,
                snapshot_index = node.log.snapshot_index(),
                last_index = node.last_log_index(),
                "restored persisted state"
            );
        }

        let now = Instant::now();
        let inner = Inner {
            persisted: node.hard_state(),
            node,
            storage,
            pending_snapshot: None,
            last_reset_election: now,
            last_reset_heartbeat: now,
            halted: false,
        };
        let shared = Arc::new(Shared {
            id,
            peers: cluster.into_iter().filter(|&n| n != id).collect(),
            config,
            inner: Mutex::new(inner),
            transport,
            apply_tx,
            killed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        let handles = vec![
            tokio::spawn(election_ticker(weak.clone())),
            tokio::spawn(heartbeat_ticker(weak.clone())),
            tokio::spawn(apply_ticker(weak, shared.config.apply_period())),
        ];
        *shared.tasks.lock() = handles;
        Ok(Self { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// stop every background task; further calls report the node as halted
    pub fn kill(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);
        self.shared.inner.lock().halted = true;
        for handle in self.shared.tasks.lock().drain(..) {
            handle.abort();
        }
        info!(node_id = self.shared.id, "node killed");
    }

    pub fn is_halted(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }

    // -- client calls --

    /// Start(command) -> (index, term, is_leader). returns immediately; the
    /// caller watches the apply channel to learn whether the command commits.
    pub fn start(&self, command: Vec<u8>) -> Result<(u64, u64, bool), RaftError> {
        self.shared.with_node(|inner| inner.node.start(command))
    }

    /// (current term, is leader)
    pub fn get_state(&self) -> (u64, bool) {
        self.shared.inner.lock().node.get_state()
    }

    /// last leader this node heard from in its current term
    pub fn leader_hint(&self) -> Option<u64> {
        self.shared.inner.lock().node.leader_id
    }

    /// the application has captured its state through `index` in `data`;
    /// compact the log and persist the snapshot
    pub fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<(), RaftError> {
        self.shared.with_node(|inner| {
            if inner.node.compact(index) {
                inner.pending_snapshot = Some(data);
            }
        })
    }

    /// size of the persisted hard state; the application compacts when it grows too large
    pub fn raft_state_size(&self) -> u64 {
        self.shared.inner.lock().storage.raft_state_size()
    }

    // -- inbound rpc handlers --

    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let result = self.shared.with_node(|inner| {
            let (reply, reset) = inner.node.handle_vote_request(&args);
            if reset {
                inner.last_reset_election = Instant::now();
            }
            reply
        });
        result.unwrap_or_else(|e| {
            warn!(node_id = self.shared.id, error = %e, "dropping vote request");
            RequestVoteReply { term: 0, vote_granted: false, vote_outcome: VoteOutcome::Killed }
        })
    }

    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let result = self.shared.with_node(|inner| {
            let (reply, reset) = inner.node.handle_append_entries(&args);
            if reset {
                inner.last_reset_election = Instant::now();
            }
            reply
        });
        result.unwrap_or_else(|e| {
            warn!(node_id = self.shared.id, error = %e, "dropping append entries");
            AppendEntriesReply {
                term: 0,
                success: false,
                update_next_index: 0,
                network_state: NetworkState::Disconnected,
            }
        })
    }

    pub fn handle_install_snapshot(
        &self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, RaftError> {
        self.shared.with_node(|inner| {
            let (reply, reset, installed) = inner.node.handle_install_snapshot(&args);
            if reset {
                inner.last_reset_election = Instant::now();
            }
            if installed {
                inner.pending_snapshot = Some(args.data.clone());
            }
            reply
        })
    }
}

impl Shared {
    /// run `f` under the lock, then persist whatever it changed before releasing it.
    /// a failed write halts the node and the result of `f` is discarded.
    fn with_node<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> Result<R, RaftError> {
        let mut inner = self.inner.lock();
        if inner.halted {
            return Err(RaftError::Halted(self.id));
        }
        let out = f(&mut inner);

        let hard = inner.node.hard_state();
        let snapshot = inner.pending_snapshot.take();
        if snapshot.is_none() && hard == inner.persisted {
            return Ok(out);
        }
        let written = match &snapshot {
            Some(data) => inner.storage.save_hard_state_and_snapshot(&hard, data),
            None => inner.storage.save_hard_state(&hard),
        };
        match written {
            Ok(()) => {
                inner.persisted = hard;
                Ok(out)
            }
            Err(e) => {
                self.halt(&mut inner, &e);
                Err(e.into())
            }
        }
    }

    fn halt(&self, inner: &mut Inner, cause: &dyn std::fmt::Display) {
        error!(node_id = self.id, term = inner.node.current_term, error = %cause, "persistence failed, halting node");
        inner.halted = true;
        self.killed.store(true, Ordering::SeqCst);
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// send one rpc with the configured deadline; None means no information was gained
    async fn call<T>(
        &self,
        peer: u64,
        rpc: impl Future<Output = Result<T, TransportError>>,
    ) -> Option<T> {
        let result = match timeout(self.config.rpc_deadline(), rpc).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(peer)),
        };
        match result {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(node_id = self.id, peer, error = %e, "rpc failed");
                None
            }
        }
    }

    // -- election --

    fn do_election(self: &Arc<Self>) {
        let started = self.with_node(|inner| {
            let args = inner.node.start_election();
            inner.last_reset_election = Instant::now();
            (args, inner.node.state == NodeState::Leader)
        });
        let Ok((args, won)) = started else { return };
        if won {
            self.replicate();
            return;
        }

        for &peer in &self.peers {
            let shared = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                let transport = Arc::clone(&shared.transport);
                let Some(reply) = shared.call(peer, transport.request_vote(peer, args.clone())).await else {
                    return;
                };
                let became_leader = shared
                    .with_node(|inner| inner.node.handle_vote_response(peer, args.term, &reply))
                    .unwrap_or(false);
                if became_leader {
                    shared.replicate();
                }
            });
        }
    }

    // -- replication --

    /// one heartbeat round: AppendEntries (or a snapshot) to every peer
    fn replicate(self: &Arc<Self>) {
        let batch = {
            let mut inner = self.inner.lock();
            if inner.halted || inner.node.state != NodeState::Leader {
                return;
            }
            inner.last_reset_heartbeat = Instant::now();

            let mut batch = Vec::with_capacity(self.peers.len());
            for &peer in &self.peers {
                let next = inner.node.next_replication(peer);
                match next {
                    Some(Replication::Entries(args)) => batch.push((peer, Outbound::Append(args))),
                    Some(Replication::Snapshot) => {
                        let read = inner.storage.read_snapshot();
                        match read {
                            Ok(data) => {
                                let args = inner.node.snapshot_args(data);
                                batch.push((peer, Outbound::Snapshot(args)));
                            }
                            Err(e) => {
                                self.halt(&mut inner, &e);
                                return;
                            }
                        }
                    }
                    None => {}
                }
            }
            batch
        };

        for (peer, outbound) in batch {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let transport = Arc::clone(&shared.transport);
                match outbound {
                    Outbound::Append(args) => {
                        let rpc = transport.append_entries(peer, args.clone());
                        if let Some(reply) = shared.call(peer, rpc).await {
                            let _ = shared.with_node(|inner| {
                                inner.node.handle_append_entries_response(peer, &args, &reply)
                            });
                        }
                    }
                    Outbound::Snapshot(args) => {
                        let rpc = transport.install_snapshot(peer, args.clone());
                        if let Some(reply) = shared.call(peer, rpc).await {
                            let _ = shared.with_node(|inner| {
                                inner.node.handle_install_snapshot_response(peer, &args, &reply)
                            });
                        }
                    }
                }
            });
        }
    }
}

// -- background tickers --

async fn election_ticker(weak: Weak<Shared>) {
    let mut election_timeout = match weak.upgrade() {
        Some(shared) => shared.config.random_election_timeout(),
        None => return,
    };
    loop {
        let Some(shared) = weak.upgrade() else { return };
        if shared.is_killed() {
            return;
        }
        let wait = {
            let mut inner = shared.inner.lock();
            if inner.node.state == NodeState::Leader {
                // leaders never time out; a future step-down starts a full window
                inner.last_reset_election = Instant::now();
                Some(shared.config.heartbeat())
            } else {
                // a reset during the previous sleep pushes the deadline out
                (inner.last_reset_election + election_timeout).checked_duration_since(Instant::now())
            }
        };
        match wait {
            Some(remaining) if remaining > Duration::from_millis(1) => {
                drop(shared);
                sleep(remaining).await;
            }
            _ => {
                shared.do_election();
                election_timeout = shared.config.random_election_timeout();
            }
        }
    }
}

async fn heartbeat_ticker(weak: Weak<Shared>) {
    loop {
        let Some(shared) = weak.upgrade() else { return };
        if shared.is_killed() {
            return;
        }
        let wait = {
            let inner = shared.inner.lock();
            if inner.node.state != NodeState::Leader {
                Some(shared.config.heartbeat())
            } else {
                (inner.last_reset_heartbeat + shared.config.heartbeat())
                    .checked_duration_since(Instant::now())
            }
        };
        match wait {
            Some(remaining) if remaining > Duration::from_millis(1) => {
                drop(shared);
                sleep(remaining).await;
            }
            _ => shared.replicate(),
        }
    }
}

async fn apply_ticker(weak: Weak<Shared>, period: Duration) {
    loop {
        sleep(period).await;
        let Some(shared) = weak.upgrade() else { return };
        let messages = {
            let mut inner = shared.inner.lock();
            if inner.halted {
                return;
            }
            inner.node.take_apply_messages()
        };
        for msg in messages {
            if shared.apply_tx.send(msg).is_err() {
                debug!(node_id = shared.id, "apply channel closed, stopping apply loop");
                return;
            }
        }
    }
}
