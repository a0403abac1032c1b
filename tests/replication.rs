mod common;

use anyhow::Result;
use common::{build, cluster, entry, replica, seeded_store, settle, settle_partitioned};
use raft_replica::machine::MemoryMachine;
use raft_replica::raft::{RaftConfig, Replica};
use raft_replica::storage::{FileStore, PersistentState};
use raft_replica::{RaftMessage, ServerRole};

const CLIENT: u64 = 99;

fn new_entry(data: &str) -> RaftMessage {
    RaftMessage::NewEntry {
        source: CLIENT,
        data: data.as_bytes().to_vec(),
    }
}

fn append(
    source: u64,
    term: u64,
    prev: (u64, u64),
    entries: Vec<raft_replica::LogEntry>,
    leader_commit: u64,
) -> RaftMessage {
    RaftMessage::AppendEntries {
        source,
        term,
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        entries,
        leader_commit,
    }
}

#[test]
fn empty_log_accepts_the_initial_probe() -> Result<()> {
    let (mut follower, net) = replica(1, 3);
    follower.handle_message(append(0, 1, (0, 0), Vec::new(), 0))?;
    assert!(matches!(
        net.take().as_slice(),
        [(0, RaftMessage::AppendEntriesResponse { success: true, match_index: Some(0), .. })]
    ));
    assert_eq!(follower.current_leader(), Some(0));
    assert_eq!(follower.role(), ServerRole::Follower);
    Ok(())
}

#[test]
fn follower_truncates_a_divergent_suffix() -> Result<()> {
    let (mut follower, net) = replica(1, 5);

    // Old leader 0 replicates two entries, then a burst it never commits.
    follower.handle_message(append(
        0,
        1,
        (0, 0),
        vec![entry(1, 1, "a"), entry(1, 2, "b")],
        0,
    ))?;
    follower.handle_message(append(
        0,
        1,
        (2, 1),
        vec![entry(1, 3, "x1"), entry(1, 4, "x2"), entry(1, 5, "x3")],
        0,
    ))?;
    net.take();
    assert_eq!(follower.storage().last_entry().index, 5);

    // The next leader overwrites everything from index 3 on.
    follower.handle_message(append(2, 3, (2, 1), vec![entry(3, 3, "y")], 3))?;
    assert!(matches!(
        net.take().as_slice(),
        [(2, RaftMessage::AppendEntriesResponse { success: true, match_index: Some(3), .. })]
    ));
    assert_eq!(follower.storage().last_entry().index, 3);
    assert_eq!(follower.storage().entry(3).unwrap().term, 3);
    assert!(follower.storage().entry(4).is_none());
    assert_eq!(follower.commit_index(), 3);
    assert_eq!(follower.machine().applied().len(), 3);
    Ok(())
}

#[test]
fn duplicated_append_entries_are_idempotent() -> Result<()> {
    let (mut follower, net) = replica(1, 3);
    let message = append(0, 1, (0, 0), vec![entry(1, 1, "a"), entry(1, 2, "b")], 1);
    follower.handle_message(message.clone())?;
    follower.handle_message(message)?;

    let sent = net.take();
    assert_eq!(sent.len(), 2);
    for (_, response) in &sent {
        assert!(matches!(
            response,
            RaftMessage::AppendEntriesResponse { success: true, match_index: Some(2), .. }
        ));
    }
    assert_eq!(follower.storage().last_entry().index, 2);
    assert_eq!(follower.commit_index(), 1);
    Ok(())
}

#[test]
fn commit_index_is_clamped_and_monotonic() -> Result<()> {
    let (mut follower, net) = replica(1, 3);

    // leaderCommit beyond what this request establishes is clamped.
    follower.handle_message(append(0, 1, (0, 0), vec![entry(1, 1, "a")], 7))?;
    assert_eq!(follower.commit_index(), 1);

    // A stale heartbeat with an older commit index cannot move it back.
    follower.handle_message(append(0, 1, (0, 0), Vec::new(), 0))?;
    assert_eq!(follower.commit_index(), 1);
    net.take();
    Ok(())
}

#[test]
fn stale_term_append_is_rejected_with_current_term() -> Result<()> {
    let (mut follower, net) = build(1, 3, seeded_store(4, &[]), MemoryMachine::new());
    follower.handle_message(append(0, 2, (0, 0), vec![entry(2, 1, "old")], 0))?;
    assert!(matches!(
        net.take().as_slice(),
        [(0, RaftMessage::AppendEntriesResponse { term: 4, success: false, match_index: None, .. })]
    ));
    assert_eq!(follower.storage().last_entry().index, 0, "stale leader must not append");
    Ok(())
}

/// A new leader whose followers are far behind probes backwards one index
/// at a time, then ships the whole missing tail; prior-term entries do not
/// commit until an entry of the current term reaches a majority.
#[test]
fn backoff_catchup_and_the_current_term_commit_rule() -> Result<()> {
    let (mut leader, lnet) = build(0, 3, seeded_store(1, &[(1, 1), (1, 2)]), MemoryMachine::new());
    let (mut follower, fnet) = replica(1, 3);

    leader.handle_timeout()?; // candidate for term 2
    lnet.take(); // vote requests, not needed
    for source in [1, 2] {
        leader.handle_message(RaftMessage::RequestVoteResponse {
            source,
            term: 2,
            vote_granted: true,
        })?;
    }
    assert_eq!(leader.role(), ServerRole::Leader);

    // Initial heartbeat probes at prev=(2,1); the empty follower rejects,
    // the leader backs off one index and retries with entries, twice.
    let mut to_follower: Vec<_> = lnet
        .take()
        .into_iter()
        .filter(|(to, _)| *to == 1)
        .collect();
    for _ in 0..3 {
        assert_eq!(to_follower.len(), 1);
        let (_, message) = to_follower.pop().unwrap();
        follower.handle_message(message)?;
        for (to, response) in fnet.take() {
            assert_eq!(to, 0);
            leader.handle_message(response)?;
        }
        to_follower = lnet.take().into_iter().filter(|(to, _)| *to == 1).collect();
    }

    // Logs converged...
    assert_eq!(common::full_log(&leader), common::full_log(&follower));
    assert_eq!(follower.storage().last_entry().index, 2);
    // ...but nothing committed: both entries are from term 1, and the
    // leader's term is 2.
    assert_eq!(leader.commit_index(), 0);

    // One current-term entry commits, and carries the old ones with it.
    leader.handle_message(new_entry("c"))?;
    for (to, message) in lnet.take() {
        if to == 1 {
            follower.handle_message(message)?;
        }
    }
    for (_, response) in fnet.take() {
        leader.handle_message(response)?;
    }
    assert_eq!(leader.commit_index(), 3);
    Ok(())
}

#[test]
fn heartbeat_advances_commit_without_touching_the_log() -> Result<()> {
    let (mut replicas, nets) = cluster(5);
    replicas[0].handle_timeout()?;
    settle(&mut replicas, &nets);
    assert_eq!(replicas[0].role(), ServerRole::Leader);

    for data in ["z1", "z2", "z3", "z4", "z"] {
        replicas[0].handle_message(new_entry(data))?;
    }
    // Follower 4's acknowledgments are lost, but three followers are more
    // than a majority: the leader commits index 5 alone.
    settle_partitioned(&mut replicas, &nets, &[4]);
    assert_eq!(replicas[0].commit_index(), 5);
    for follower in &replicas[1..4] {
        assert_eq!(follower.storage().last_entry().index, 5);
        assert_eq!(follower.commit_index(), 0, "commit travels on the next round");
    }

    // The heartbeat round carries leaderCommit; followers advance without
    // any log mutation.
    replicas[0].handle_timeout()?;
    settle(&mut replicas, &nets);
    for follower in &replicas[1..4] {
        assert_eq!(follower.commit_index(), 5);
        assert_eq!(follower.storage().last_entry().index, 5);
        assert_eq!(follower.machine().applied().len(), 5);
    }

    // Replica 4 missed the entries entirely; the next entry-carrying round
    // repairs it end to end.
    replicas[0].handle_message(new_entry("tail"))?;
    settle(&mut replicas, &nets);
    replicas[0].handle_timeout()?;
    settle(&mut replicas, &nets);
    assert_eq!(replicas[4].storage().last_entry().index, 6);
    assert_eq!(replicas[4].commit_index(), 6);
    Ok(())
}

#[test]
fn followers_redirect_clients_to_the_leader() -> Result<()> {
    let (mut follower, net) = replica(1, 3);

    // Before any leader is known the redirect is empty; clients retry.
    follower.handle_message(new_entry("q"))?;
    assert!(matches!(
        net.take().as_slice(),
        [(CLIENT, RaftMessage::NewEntryResponse { accepted: false, leader_redirect: None, .. })]
    ));

    // A heartbeat teaches the follower who leads.
    follower.handle_message(append(0, 1, (0, 0), Vec::new(), 0))?;
    net.take();
    follower.handle_message(new_entry("q"))?;
    assert!(matches!(
        net.take().as_slice(),
        [(
            CLIENT,
            RaftMessage::NewEntryResponse { accepted: false, leader_redirect: Some(0), .. }
        )]
    ));
    Ok(())
}

/// Scenario: a leader crashes holding an uncommitted entry, the cluster
/// moves on, and the rejoining server is truncated back into agreement.
#[test]
fn crashed_leader_rejoins_and_converges() -> Result<()> {
    let (mut replicas, nets) = cluster(5);
    replicas[0].handle_timeout()?;
    settle(&mut replicas, &nets);
    assert_eq!(replicas[0].role(), ServerRole::Leader);

    replicas[0].handle_message(new_entry("a"))?;
    replicas[0].handle_message(new_entry("b"))?;
    settle(&mut replicas, &nets);
    replicas[0].handle_timeout()?; // heartbeat spreads commit=2
    settle(&mut replicas, &nets);
    for r in &replicas {
        assert_eq!(r.commit_index(), 2);
    }

    // Server 0 accepts one more entry and crashes before replicating it.
    replicas[0].handle_message(new_entry("rogue"))?;
    assert_eq!(replicas[0].storage().last_entry().index, 3);
    nets[0].take(); // its outbound replication round is lost with it

    // The survivors elect server 1, which commits a new index-3 entry.
    replicas[1].handle_timeout()?;
    settle_partitioned(&mut replicas, &nets, &[0]);
    assert_eq!(replicas[1].role(), ServerRole::Leader);
    assert_eq!(replicas[1].current_term(), 2);
    replicas[1].handle_message(new_entry("y"))?;
    settle_partitioned(&mut replicas, &nets, &[0]);
    assert_eq!(replicas[1].commit_index(), 3);

    // Server 0 rejoins. The next entry round reaches it with
    // prev=(2, term 1); it truncates the rogue entry and converges.
    replicas[1].handle_message(new_entry("w"))?;
    settle(&mut replicas, &nets);
    replicas[1].handle_timeout()?; // heartbeat spreads the final commit
    settle(&mut replicas, &nets);

    assert_eq!(replicas[0].role(), ServerRole::Follower);
    assert_eq!(replicas[0].current_term(), 2);
    let reference = common::full_log(&replicas[1]);
    assert_eq!(reference.len(), 4);
    assert_eq!(reference[2].data, b"y".to_vec());
    for r in &replicas {
        assert_eq!(common::full_log(r), reference, "logs must converge");
        assert_eq!(r.commit_index(), 4);
    }
    // State-machine safety: everyone applied the same sequence, and the
    // rogue entry is nowhere in it.
    for r in &replicas {
        let applied: Vec<_> = r.machine().applied().iter().map(|e| e.data.clone()).collect();
        assert_eq!(applied, vec![b"a".to_vec(), b"b".to_vec(), b"y".to_vec(), b"w".to_vec()]);
    }
    Ok(())
}

#[test]
fn snapshots_truncate_the_log_and_replication_survives() -> Result<()> {
    // Leader snapshots every two applied entries; followers never do.
    let mut replicas = Vec::new();
    let mut nets = Vec::new();
    for id in 0..3 {
        let machine = if id == 0 {
            MemoryMachine::with_snapshot_every(2)
        } else {
            MemoryMachine::new()
        };
        let (r, n) = build(id, 3, raft_replica::storage::MemoryStore::new(), machine);
        replicas.push(r);
        nets.push(n);
    }

    replicas[0].handle_timeout()?;
    settle(&mut replicas, &nets);
    assert_eq!(replicas[0].role(), ServerRole::Leader);

    replicas[0].handle_message(new_entry("a"))?;
    replicas[0].handle_message(new_entry("b"))?;
    settle(&mut replicas, &nets);
    assert_eq!(replicas[0].commit_index(), 2);

    // Applying through index 2 produced a snapshot; the leader's log was
    // garbage-collected behind it.
    assert!(replicas[0].storage().entry(1).is_none());
    assert!(replicas[0].storage().entry(2).is_none());
    assert_eq!(replicas[0].storage().last_entry().index, 2);

    // The next entry's prev pointer comes from the snapshot boundary.
    replicas[0].handle_message(new_entry("c"))?;
    settle(&mut replicas, &nets);
    replicas[0].handle_timeout()?;
    settle(&mut replicas, &nets);
    for r in &replicas {
        assert_eq!(r.commit_index(), 3);
        assert_eq!(r.machine().applied().len(), 3);
    }
    assert_eq!(replicas[1].storage().last_entry().index, 3);
    Ok(())
}

/// Term, vote, and log survive a restart, the way the on-disk store is
/// meant to be reopened.
#[test]
fn replica_state_survives_a_restart() -> Result<()> {
    let path = std::env::temp_dir().join(format!("raft_restart_test_{}.bin", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let config = RaftConfig {
        me: 0,
        peers: Vec::new(),
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 50,
    };
    let net = common::TestNet::new();

    {
        let store = FileStore::open(&path)?;
        let (mut replica, _handle) =
            Replica::new(config.clone(), store, MemoryMachine::new(), net.clone());
        replica.handle_timeout()?; // single-server election
        assert_eq!(replica.role(), ServerRole::Leader);
        for data in ["test1", "test2", "test3"] {
            replica.handle_message(new_entry(data))?;
        }
        assert_eq!(replica.commit_index(), 3);
    }

    let store = FileStore::open(&path)?;
    let (restarted, _handle) = Replica::new(config, store, MemoryMachine::new(), net);
    assert_eq!(restarted.current_term(), 1);
    assert_eq!(restarted.storage().voted_for(), Some(0));
    assert_eq!(restarted.storage().last_entry().index, 3);
    assert_eq!(restarted.storage().entry(1).unwrap().data, b"test1".to_vec());
    std::fs::remove_file(&path)?;
    Ok(())
}
