//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, state.rs for persistence/apply
//! what: NodeState enum, RaftNode struct, election, replication, snapshot and apply bookkeeping
//!
//! the node is purely synchronous: it never sleeps, sends or persists. the caller
//! (raft-node) serializes every call behind one lock, persists `hard_state()` after
//! each call and acts on the returned "reset election timer" flags.

use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    NetworkState, RequestVoteArgs, RequestVoteReply, VoteOutcome,
};
use crate::state::{ApplyMsg, HardState};
use crate::{CoreError, LogEntry, RaftConfig, RaftLog};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// What a leader should send to one peer in a replication round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    /// incremental AppendEntries (empty entries = heartbeat)
    Entries(AppendEntriesArgs),
    /// the peer needs entries we already compacted; send the snapshot instead
    Snapshot,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every member of the (fixed) cluster, self included
    pub cluster_nodes: Vec<u64>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    pub log: RaftLog,
    /// Highest log index known to be committed
    pub commit_index: u64,
    /// Highest log index handed to the application
    pub last_applied: u64,
    /// Last leader heard from in the current term
    pub leader_id: Option<u64>,
    /// Votes collected while a candidate (self included)
    pub votes_received: Vec<u64>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<u64, u64>,
    /// installed snapshots waiting to be handed to the application
    pending_snapshots: VecDeque<ApplyMsg>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending_snapshots: VecDeque::new(),
        }
    }

    /// reload persisted hard state (and the snapshot it points at) after a restart
    pub fn restore(&mut self, hard: HardState, snapshot: Vec<u8>) -> Result<(), CoreError> {
        self.log = RaftLog::from_parts(
            hard.last_snapshot_include_index,
            hard.last_snapshot_include_term,
            hard.logs,
        )?;
        self.current_term = hard.current_term;
        self.voted_for = hard.voted_for;
        self.state = NodeState::Follower;
        self.commit_index = self.log.snapshot_index();
        self.last_applied = self.log.snapshot_index();
        if self.log.snapshot_index() > 0 && !snapshot.is_empty() {
            self.pending_snapshots.push_back(ApplyMsg::Snapshot {
                index: self.log.snapshot_index(),
                term: self.log.snapshot_term(),
                data: snapshot,
            });
        }
        Ok(())
    }

    /// the durable part of this node
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            last_snapshot_include_index: self.log.snapshot_index(),
            last_snapshot_include_term: self.log.snapshot_term(),
            logs: self.log.entries().to_vec(),
        }
    }

    /// (term, is_leader)
    pub fn get_state(&self) -> (u64, bool) {
        (self.current_term, self.state == NodeState::Leader)
    }

    /// every member except self
    pub fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// term at `index`, 0 when unknown
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- role transitions --

    /// adopt `term` (clearing the vote if it is newer) and fall back to follower
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node_id = self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
    }

    /// election timeout fired: bump the term, vote for self and build the vote request
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        info!(node_id = self.id, term = self.current_term, "starting election");

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        if self.has_quorum() {
            self.become_leader();
        }
        args
    }

    fn become_leader(&mut self) {
        assert_eq!(
            self.state,
            NodeState::Candidate,
            "node {} became leader twice in term {}",
            self.id,
            self.current_term
        );
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        info!(node_id = self.id, term = self.current_term, last_index = next - 1, "became leader");
    }

    // -- election --

    /// returns the reply and whether the election timer should be reset
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term {
            return (self.vote_reply(VoteOutcome::StaleTerm), false);
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let outcome = if self.voted_for.is_some_and(|v| v != args.candidate_id) {
            VoteOutcome::AlreadyVoted
        } else if !self.log.is_up_to_date(args.last_log_index, args.last_log_term) {
            VoteOutcome::LogBehind
        } else {
            self.voted_for = Some(args.candidate_id);
            VoteOutcome::Granted
        };

        debug!(
            node_id = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            ?outcome,
            "handled vote request"
        );
        (self.vote_reply(outcome), outcome == VoteOutcome::Granted)
    }

    fn vote_reply(&self, outcome: VoteOutcome) -> RequestVoteReply {
        RequestVoteReply {
            term: self.current_term,
            vote_granted: outcome == VoteOutcome::Granted,
            vote_outcome: outcome,
        }
    }

    /// count a vote for the election started in `request_term`; true if this made us leader
    pub fn handle_vote_response(
        &mut self,
        from: u64,
        request_term: u64,
        reply: &RequestVoteReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Candidate || self.current_term != request_term {
            return false;
        }
        if !reply.vote_granted {
            debug!(node_id = self.id, term = self.current_term, from, outcome = ?reply.vote_outcome, "vote refused");
            return false;
        }
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- client entry point --

    /// append a command to the leader's log; None if not leader
    pub fn propose(&mut self, command: Vec<u8>) -> Option<LogEntry> {
        if self.state != NodeState::Leader {
            return None;
        }
        let index = self.log.append(self.current_term, command);
        self.advance_commit_index();
        self.log.get(index).cloned()
    }

    /// Start(command) -> (index, term, is_leader)
    pub fn start(&mut self, command: Vec<u8>) -> (u64, u64, bool) {
        match self.propose(command) {
            Some(entry) => (entry.index, entry.term, true),
            None => (0, self.current_term, false),
        }
    }

    // -- replication (leader side) --

    /// what to send `peer` this round, or None if we are not leader
    pub fn next_replication(&self, peer: u64) -> Option<Replication> {
        if self.state != NodeState::Leader {
            return None;
        }
        let last = self.log.last_index();
        let next = self.next_index.get(&peer).copied().unwrap_or(last + 1).min(last + 1);
        if next <= self.log.snapshot_index() {
            return Some(Replication::Snapshot);
        }
        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            return Some(Replication::Snapshot);
        };
        Some(Replication::Entries(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        }))
    }

    /// InstallSnapshot carrying the given snapshot bytes at our boundary
    pub fn snapshot_args(&self, data: Vec<u8>) -> InstallSnapshotArgs {
        InstallSnapshotArgs {
            term: self.current_term,
            leader_id: self.id,
            last_include_index: self.log.snapshot_index(),
            last_include_term: self.log.snapshot_term(),
            data,
        }
    }

    /// reconcile a follower's answer; true if the commit index advanced
    pub fn handle_append_entries_response(
        &mut self,
        peer: u64,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> bool {
        if reply.network_state != NetworkState::Normal {
            return false;
        }
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Leader || self.current_term != args.term {
            return false;
        }

        let matched = self.match_index.get(&peer).copied().unwrap_or(0);
        if !reply.success {
            if reply.update_next_index == 0 {
                return false;
            }
            let next = reply
                .update_next_index
                .max(matched + 1)
                .min(self.log.last_index() + 1);
            debug!(node_id = self.id, peer, next, "follower rejected append, backing off");
            self.next_index.insert(peer, next);
            return false;
        }

        let replicated = args.prev_log_index + args.entries.len() as u64;
        let matched = matched.max(replicated);
        self.match_index.insert(peer, matched);
        self.next_index.insert(peer, matched + 1);
        self.advance_commit_index()
    }

    /// move commit_index to the highest current-term index held by a majority
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let old = self.commit_index;
        for n in (old + 1..=self.log.last_index()).rev() {
            match self.log.term_at(n) {
                Some(term) if term == self.current_term => {}
                // terms only decrease walking backwards
                _ => break,
            }
            let replicas = 1 + self
                .peers()
                .filter(|p| self.match_index.get(p).copied().unwrap_or(0) >= n)
                .count();
            if replicas >= self.quorum_size() {
                self.commit_index = n;
                break;
            }
        }
        if self.commit_index > old {
            debug!(node_id = self.id, term = self.current_term, commit = self.commit_index, "commit index advanced");
            return true;
        }
        false
    }

    // -- replication (follower side) --

    /// returns the reply and whether the election timer should be reset
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            debug!(node_id = self.id, term = self.current_term, leader = args.leader_id, stale = args.term, "rejecting append from stale leader");
            return (self.append_reply(false, 0), false);
        }
        if args.term == self.current_term && self.state == NodeState::Leader {
            panic!("node {} received append from leader {} in its own term {}", self.id, args.leader_id, args.term);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);

        let prev = args.prev_log_index;
        if prev > self.log.last_index() {
            return (self.append_reply(false, self.log.last_index() + 1), true);
        }
        if prev < self.log.snapshot_index() {
            return (self.append_reply(false, self.log.snapshot_index() + 1), true);
        }
        if !self.log.matches(prev, args.prev_log_term) {
            let retry = self.log.first_index_of_term(prev);
            debug!(node_id = self.id, term = self.current_term, prev, retry, "log mismatch at prev index");
            return (self.append_reply(false, retry), true);
        }

        for entry in &args.entries {
            match self.log.term_at(entry.index) {
                None => self.log.push(entry.clone()),
                Some(term) if term == entry.term => {
                    if let Some(existing) = self.log.get(entry.index) {
                        if existing.command != entry.command {
                            panic!(
                                "node {}: index {} term {} holds different commands locally and from leader {}",
                                self.id, entry.index, entry.term, args.leader_id
                            );
                        }
                    }
                }
                Some(_) => {
                    assert!(
                        entry.index > self.commit_index,
                        "node {}: leader {} overwrites committed index {}",
                        self.id,
                        args.leader_id,
                        entry.index
                    );
                    self.log.truncate_from(entry.index);
                    self.log.push(entry.clone());
                }
            }
        }

        let last_new = prev + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(args.leader_commit.min(last_new));
        }
        debug_assert!(self.commit_index <= self.log.last_index());
        (self.append_reply(true, 0), true)
    }

    fn append_reply(&self, success: bool, update_next_index: u64) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success,
            update_next_index,
            network_state: NetworkState::Normal,
        }
    }

    // -- snapshots --

    /// follower side of InstallSnapshot.
    /// returns (reply, reset election timer, snapshot installed)
    pub fn handle_install_snapshot(
        &mut self,
        args: &InstallSnapshotArgs,
    ) -> (InstallSnapshotReply, bool, bool) {
        if args.term < self.current_term {
            return (InstallSnapshotReply { term: self.current_term }, false, false);
        }
        if args.term == self.current_term && self.state == NodeState::Leader {
            panic!("node {} received snapshot from leader {} in its own term {}", self.id, args.leader_id, args.term);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);
        let reply = InstallSnapshotReply { term: self.current_term };

        let index = args.last_include_index;
        if index <= self.log.snapshot_index() || index <= self.last_applied {
            debug!(node_id = self.id, index, boundary = self.log.snapshot_index(), "ignoring stale snapshot");
            return (reply, true, false);
        }

        self.log.install_snapshot(index, args.last_include_term);
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
        self.pending_snapshots.push_back(ApplyMsg::Snapshot {
            index,
            term: args.last_include_term,
            data: args.data.clone(),
        });
        info!(node_id = self.id, term = self.current_term, index, "installed snapshot from leader");
        (reply, true, true)
    }

    /// leader side: the peer now holds everything up to our snapshot boundary
    pub fn handle_install_snapshot_response(
        &mut self,
        peer: u64,
        args: &InstallSnapshotArgs,
        reply: &InstallSnapshotReply,
    ) {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return;
        }
        if self.state != NodeState::Leader || self.current_term != args.term {
            return;
        }
        let matched = self
            .match_index
            .get(&peer)
            .copied()
            .unwrap_or(0)
            .max(args.last_include_index);
        self.match_index.insert(peer, matched);
        self.next_index.insert(peer, matched + 1);
    }

    /// application-requested compaction through `index`; false if nothing changed
    pub fn compact(&mut self, index: u64) -> bool {
        if index <= self.log.snapshot_index() || index > self.commit_index {
            debug!(node_id = self.id, index, boundary = self.log.snapshot_index(), commit = self.commit_index, "compaction request ignored");
            return false;
        }
        if !self.log.compact_to(index) {
            return false;
        }
        self.last_applied = self.last_applied.max(index);
        info!(node_id = self.id, term = self.current_term, index, "compacted log");
        true
    }

    // -- apply pipeline --

    /// drain everything ready for the application, in commit order:
    /// installed snapshots first, then commands in (last_applied, commit_index]
    pub fn take_apply_messages(&mut self) -> Vec<ApplyMsg> {
        let mut out: Vec<ApplyMsg> = self.pending_snapshots.drain(..).collect();
        if self.commit_index > self.last_applied {
            out.extend(
                self.log
                    .entries_between(self.last_applied, self.commit_index)
                    .into_iter()
                    .map(|e| ApplyMsg::Command { index: e.index, term: e.term, command: e.command }),
            );
            self.last_applied = self.commit_index;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn restore_rebuilds_boundary_and_queues_snapshot() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let hard = HardState {
            current_term: 4,
            voted_for: Some(2),
            last_snapshot_include_index: 10,
            last_snapshot_include_term: 3,
            logs: vec![LogEntry::new(4, 11, b"x".to_vec())],
        };
        node.restore(hard.clone(), b"snap".to_vec()).unwrap();

        assert_eq!(node.hard_state(), hard);
        assert_eq!(node.commit_index, 10);
        assert_eq!(node.last_applied, 10);
        let msgs = node.take_apply_messages();
        assert_eq!(msgs, vec![ApplyMsg::Snapshot { index: 10, term: 3, data: b"snap".to_vec() }]);
    }

    #[test]
    fn follower_cannot_propose() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.start(b"cmd".to_vec()), (0, 0, false));
        assert!(node.log.is_empty());
    }
}
