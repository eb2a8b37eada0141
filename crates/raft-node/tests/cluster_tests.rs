//! # cluster tests
//!
//! why: exercise elections, replication, partitions, crashes and snapshots end to end
//! relations: runs several raft-node instances over LocalNetwork with FileStorage in a tempdir
//! what: leader election, agreement, leader isolation, crash recovery, snapshot catch-up

use parking_lot::Mutex;
use raft_node::{ApplyMsg, LocalNetwork, Raft, RaftConfig};
use raft_storage::FileStorage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 25,
        apply_interval: 10,
        rpc_timeout: 100,
    }
}

/// apply stream of one node incarnation
type Applied = Arc<Mutex<Vec<ApplyMsg>>>;

struct Cluster {
    ids: Vec<u64>,
    network: LocalNetwork,
    dir: TempDir,
    nodes: HashMap<u64, Raft>,
    applied: HashMap<u64, Applied>,
}

impl Cluster {
    fn new(size: u64) -> Self {
        init_tracing();
        let mut cluster = Self {
            ids: (1..=size).collect(),
            network: LocalNetwork::with_jitter(5),
            dir: tempfile::tempdir().unwrap(),
            nodes: HashMap::new(),
            applied: HashMap::new(),
        };
        for id in cluster.ids.clone() {
            cluster.start_node(id);
        }
        cluster
    }

    /// launch (or relaunch) node `id` from whatever its storage holds
    fn start_node(&mut self, id: u64) {
        let storage = FileStorage::open(self.dir.path(), id).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raft = Raft::launch(
            id,
            self.ids.clone(),
            test_config(),
            Box::new(storage),
            self.network.transport(id),
            tx,
        )
        .unwrap();

        // a fresh collector per incarnation, so late messages of a crashed one are not mixed in
        let applied = Applied::default();
        self.applied.insert(id, Arc::clone(&applied));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                applied.lock().push(msg);
            }
        });

        self.network.register(raft.clone());
        self.nodes.insert(id, raft);
    }

    fn crash(&mut self, id: u64) {
        if let Some(raft) = self.nodes.remove(&id) {
            raft.kill();
        }
        self.network.remove(id);
    }

    fn restart(&mut self, id: u64) {
        self.crash(id);
        self.start_node(id);
    }

    fn node(&self, id: u64) -> &Raft {
        &self.nodes[&id]
    }

    fn applied(&self, id: u64) -> Vec<ApplyMsg> {
        self.applied.get(&id).map(|a| a.lock().clone()).unwrap_or_default()
    }

    /// the single leader among connected nodes; panics on two leaders in one term
    async fn wait_for_leader(&self) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
            let mut leaders: HashMap<u64, Vec<u64>> = HashMap::new();
            for (&id, raft) in &self.nodes {
                if !self.network.is_connected(id) {
                    continue;
                }
                let (term, is_leader) = raft.get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(id);
                }
            }
            for (term, ids) in &leaders {
                assert_eq!(ids.len(), 1, "term {term} has leaders {ids:?}");
            }
            if let Some(term) = leaders.keys().max() {
                return leaders[term][0];
            }
        }
        panic!("no leader elected");
    }

    /// submit `command` until it is applied by every node in `expect`; returns its index
    async fn one(&self, command: &[u8], expect: &[u64]) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let leader = self.wait_for_leader().await;
            let Ok((index, _, true)) = self.node(leader).start(command.to_vec()) else {
                continue;
            };
            let settle = Instant::now() + Duration::from_secs(2);
            while Instant::now() < settle {
                if expect.iter().all(|&id| self.has_applied(id, index, command)) {
                    return index;
                }
                sleep(Duration::from_millis(20)).await;
            }
        }
        panic!("command {:?} never reached agreement", String::from_utf8_lossy(command));
    }

    fn has_applied(&self, id: u64, index: u64, command: &[u8]) -> bool {
        self.applied(id).iter().any(|msg| {
            matches!(msg, ApplyMsg::Command { index: i, command: c, .. } if *i == index && c == command)
        })
    }

    async fn wait_until(&self, what: &str, mut check: impl FnMut(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check(self) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn shutdown(mut self) {
        for id in self.ids.clone() {
            self.crash(id);
        }
    }
}

/// apply indices must be strictly increasing with no gaps after the first message
fn assert_in_order(msgs: &[ApplyMsg]) {
    for pair in msgs.windows(2) {
        assert_eq!(pair[1].index(), pair[0].index() + 1, "apply stream out of order: {msgs:?}");
    }
}

// =============================================================================
// SECTION 1: ELECTION
// =============================================================================

mod election {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn initial_election_picks_one_leader() {
        let cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let (term, _) = cluster.node(leader).get_state();
        assert!(term >= 1);

        // with no failures the term holds steady
        sleep(Duration::from_millis(600)).await;
        let (later, still_leader) = cluster.node(leader).get_state();
        assert_eq!(later, term);
        assert!(still_leader);

        for id in [1, 2, 3] {
            assert_eq!(cluster.node(id).leader_hint(), Some(leader));
        }
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_on_follower_is_refused() {
        let cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();

        let (index, _, is_leader) = cluster.node(follower).start(b"nope".to_vec()).unwrap();
        assert!(!is_leader);
        assert_eq!(index, 0);
        cluster.shutdown();
    }
}

// =============================================================================
// SECTION 2: AGREEMENT
// =============================================================================

mod agreement {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn command_applied_everywhere_at_same_index() {
        let cluster = Cluster::new(3);
        let first = cluster.one(b"SET x 1", &[1, 2, 3]).await;
        let second = cluster.one(b"SET y 2", &[1, 2, 3]).await;
        assert!(second > first);

        for id in [1, 2, 3] {
            assert_in_order(&cluster.applied(id));
        }
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn isolated_leader_steps_down_and_catches_up() {
        let cluster = Cluster::new(3);
        cluster.one(b"before", &[1, 2, 3]).await;

        let old_leader = cluster.wait_for_leader().await;
        cluster.network.disconnect(old_leader);
        // the stranded leader still accepts this, but can never commit it
        let _ = cluster.node(old_leader).start(b"lost".to_vec());

        let rest: Vec<u64> = [1, 2, 3].into_iter().filter(|&id| id != old_leader).collect();
        let index = cluster.one(b"after", &rest).await;

        cluster.network.connect(old_leader);
        cluster
            .wait_until("old leader to catch up", |c| c.has_applied(old_leader, index, b"after"))
            .await;

        for id in [1, 2, 3] {
            let applied = cluster.applied(id);
            assert!(!applied.iter().any(|m| matches!(m, ApplyMsg::Command { command, .. } if command == b"lost")));
            assert_in_order(&applied);
        }
        cluster.shutdown();
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY
// =============================================================================

mod crash_recovery {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restarted_follower_catches_up_from_log() {
        let mut cluster = Cluster::new(3);
        cluster.one(b"a", &[1, 2, 3]).await;

        let leader = cluster.wait_for_leader().await;
        let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
        cluster.crash(follower);

        let live: Vec<u64> = [1, 2, 3].into_iter().filter(|&id| id != follower).collect();
        let index = cluster.one(b"b", &live).await;

        cluster.start_node(follower);
        cluster
            .wait_until("restarted follower to apply", |c| c.has_applied(follower, index, b"b"))
            .await;

        // replay starts from index 1: nothing was compacted
        let applied = cluster.applied(follower);
        assert_eq!(applied[0].index(), 1);
        assert_in_order(&applied);
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn whole_cluster_restart_keeps_committed_entries() {
        let mut cluster = Cluster::new(3);
        let index = cluster.one(b"durable", &[1, 2, 3]).await;

        for id in [1, 2, 3] {
            cluster.restart(id);
        }
        let next = cluster.one(b"fresh", &[1, 2, 3]).await;
        assert!(next > index);
        for id in [1, 2, 3] {
            assert!(cluster.has_applied(id, index, b"durable"));
        }
        cluster.shutdown();
    }
}

// =============================================================================
// SECTION 4: SNAPSHOTS
// =============================================================================

mod snapshots {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lagging_follower_installs_snapshot() {
        let mut cluster = Cluster::new(3);
        let leader = cluster.wait_for_leader().await;
        let lagging = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
        cluster.crash(lagging);

        let live: Vec<u64> = [1, 2, 3].into_iter().filter(|&id| id != lagging).collect();
        let mut last = 0;
        for i in 1..=5 {
            last = cluster.one(format!("SET k{i} {i}").as_bytes(), &live).await;
        }
        for &id in &live {
            cluster.node(id).snapshot(last, b"k1..k5".to_vec()).unwrap();
        }

        cluster.start_node(lagging);
        cluster
            .wait_until("snapshot install", |c| {
                c.applied(lagging)
                    .iter()
                    .any(|m| matches!(m, ApplyMsg::Snapshot { index, .. } if *index == last))
            })
            .await;

        let next = cluster.one(b"SET k6 6", &[1, 2, 3]).await;
        assert!(next > last);

        let applied = cluster.applied(lagging);
        match &applied[0] {
            ApplyMsg::Snapshot { index, data, .. } => {
                assert_eq!(*index, last);
                assert_eq!(data, b"k1..k5");
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }
        assert_in_order(&applied);
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshot_replayed_after_restart() {
        let mut cluster = Cluster::new(3);
        let index = cluster.one(b"SET a 1", &[1, 2, 3]).await;
        for id in [1, 2, 3] {
            cluster.node(id).snapshot(index, b"a=1".to_vec()).unwrap();
        }
        let size_after = cluster.node(1).raft_state_size();
        assert!(size_after > 0);

        cluster.restart(1);
        cluster
            .wait_until("snapshot replay", |c| {
                matches!(c.applied(1).first(), Some(ApplyMsg::Snapshot { index: i, .. }) if *i == index)
            })
            .await;
        cluster.shutdown();
    }
}
