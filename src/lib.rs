use serde::{Deserialize, Serialize};

pub mod dispatch;
pub mod machine;
pub mod raft;
pub mod storage;

/// Identifies a server (or client) in the cluster.
pub type PeerId = u64;

/// Election epoch. Never decreases at any replica.
pub type Term = u64;

/// A single replicated log entry. Indices are assigned by the leader,
/// start at 1, and are contiguous; index 0 is the implicit sentinel
/// `(term 0, index 0)` used as the initial prev pointer and is never
/// stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Handle to a state-machine snapshot: everything up to and including
/// `index` is folded into it, so the log may be truncated there.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    pub term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    Follower,
    Candidate,
    Leader,
}

// --- RAFT MESSAGE TYPES ---

/// Every message the replica sends or receives, including the client
/// NewEntry pair. Each variant carries the `source` id of its sender so
/// responses can be routed back without transport-level correlation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RaftMessage {
    RequestVote {
        source: PeerId,
        term: Term,
        last_log_index: u64,
        last_log_term: Term,
    },
    RequestVoteResponse {
        source: PeerId,
        term: Term,
        vote_granted: bool,
    },
    AppendEntries {
        source: PeerId,
        term: Term,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        source: PeerId,
        term: Term,
        success: bool,
        /// On success, the last index the follower now knows matches the
        /// leader (`prev_log_index + entries.len()`). Absent on rejection.
        match_index: Option<u64>,
    },
    NewEntry {
        source: PeerId,
        data: Vec<u8>,
    },
    NewEntryResponse {
        source: PeerId,
        accepted: bool,
        /// Set by non-leaders that know the current leader; a client seeing
        /// `None` with `accepted == false` should retry after a delay.
        leader_redirect: Option<PeerId>,
    },
}

impl RaftMessage {
    /// The term this message carries, if it is one of the four Raft RPCs.
    /// Client messages carry no term and skip term reconciliation.
    pub fn term(&self) -> Option<Term> {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => Some(*term),
            RaftMessage::NewEntry { .. } | RaftMessage::NewEntryResponse { .. } => None,
        }
    }

    pub fn source(&self) -> PeerId {
        match self {
            RaftMessage::RequestVote { source, .. }
            | RaftMessage::RequestVoteResponse { source, .. }
            | RaftMessage::AppendEntries { source, .. }
            | RaftMessage::AppendEntriesResponse { source, .. }
            | RaftMessage::NewEntry { source, .. }
            | RaftMessage::NewEntryResponse { source, .. } => *source,
        }
    }
}
