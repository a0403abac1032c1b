#![allow(dead_code)]

use raft_replica::dispatch::Dispatcher;
use raft_replica::machine::MemoryMachine;
use raft_replica::raft::{RaftConfig, Replica};
use raft_replica::storage::{MemoryStore, PersistentState};
use raft_replica::{LogEntry, PeerId, RaftMessage, Term};
use std::sync::{Arc, Mutex};

pub type TestReplica = Replica<MemoryStore, MemoryMachine>;

/// Captures every outbound message so tests can deliver, reorder, or drop
/// them by hand. The replica under test never notices the difference.
#[derive(Default)]
pub struct TestNet {
    sent: Mutex<Vec<(PeerId, RaftMessage)>>,
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains everything captured since the last call.
    pub fn take(&self) -> Vec<(PeerId, RaftMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Dispatcher for TestNet {
    fn send_request(&self, to: PeerId, message: RaftMessage) {
        self.sent.lock().unwrap().push((to, message));
    }

    fn send_response(&self, to: PeerId, message: RaftMessage) {
        self.sent.lock().unwrap().push((to, message));
    }
}

pub fn config(me: PeerId, cluster_size: u64) -> RaftConfig {
    RaftConfig {
        me,
        peers: (0..cluster_size).filter(|&p| p != me).collect(),
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 50,
    }
}

pub fn build(
    me: PeerId,
    cluster_size: u64,
    store: MemoryStore,
    machine: MemoryMachine,
) -> (TestReplica, Arc<TestNet>) {
    let net = TestNet::new();
    let (replica, _handle) = Replica::new(config(me, cluster_size), store, machine, net.clone());
    (replica, net)
}

pub fn replica(me: PeerId, cluster_size: u64) -> (TestReplica, Arc<TestNet>) {
    build(me, cluster_size, MemoryStore::new(), MemoryMachine::new())
}

/// Replicas with ids `0..n`, each with its own capturing net.
pub fn cluster(n: u64) -> (Vec<TestReplica>, Vec<Arc<TestNet>>) {
    (0..n).map(|id| replica(id, n)).unzip()
}

/// A store pre-loaded with a term and a log, as if recovered from disk.
pub fn seeded_store(term: Term, log: &[(Term, u64)]) -> MemoryStore {
    let mut store = MemoryStore::new();
    store.set_current_term(term).unwrap();
    for &(term, index) in log {
        store.append(entry(term, index, &format!("e{index}"))).unwrap();
    }
    store
}

pub fn entry(term: Term, index: u64, data: &str) -> LogEntry {
    LogEntry {
        term,
        index,
        data: data.as_bytes().to_vec(),
    }
}

/// Shuttles captured messages between replicas until the cluster goes
/// quiet, skipping nets and inboxes of `down` replicas. Messages addressed
/// outside the cluster (clients) are returned instead of delivered.
pub fn settle_partitioned(
    replicas: &mut [TestReplica],
    nets: &[Arc<TestNet>],
    down: &[PeerId],
) -> Vec<(PeerId, RaftMessage)> {
    let n = replicas.len() as u64;
    let mut external = Vec::new();
    loop {
        let mut pending = Vec::new();
        for (id, net) in nets.iter().enumerate() {
            let outbound = net.take();
            if down.contains(&(id as u64)) {
                continue;
            }
            pending.extend(outbound);
        }
        if pending.is_empty() {
            return external;
        }
        for (to, message) in pending {
            if to < n && !down.contains(&to) {
                replicas[to as usize].handle_message(message).unwrap();
            } else if to >= n {
                external.push((to, message));
            }
        }
    }
}

pub fn settle(replicas: &mut [TestReplica], nets: &[Arc<TestNet>]) -> Vec<(PeerId, RaftMessage)> {
    settle_partitioned(replicas, nets, &[])
}

/// The whole log a replica currently holds, for cross-replica comparison.
pub fn full_log(replica: &TestReplica) -> Vec<LogEntry> {
    let last = replica.storage().last_entry().index;
    replica.storage().entries_between(1, last + 1)
}
