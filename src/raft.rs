use crate::dispatch::Dispatcher;
use crate::machine::StateMachine;
use crate::storage::PersistentState;
use crate::{LogEntry, PeerId, RaftMessage, ServerRole, Snapshot, Term};
use anyhow::Result;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout_at, Instant};

/// Bound on the inbound message FIFO. Transport threads never block on a
/// slow replica; past this the message is dropped and the protocol's
/// timers repair the loss.
pub(crate) const INBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub me: PeerId,
    /// All other servers in the cluster. Fixed for the replica's lifetime.
    pub peers: Vec<PeerId>,
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
    pub heartbeat_interval: u64,   // milliseconds
}

impl RaftConfig {
    /// Votes (or acknowledgments) needed to win: floor(N/2) + 1.
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Mis-tunings are survivable, so they warn instead of rejecting.
    fn validate(&self) {
        let cluster = self.peers.len() + 1;
        if cluster % 2 == 0 {
            warn!(
                "[{}] cluster size {} is even; odd sizes avoid tied elections",
                self.me, cluster
            );
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            warn!(
                "[{}] heartbeat interval {}ms is not below the election minimum {}ms; \
                 followers will keep starting elections",
                self.me, self.heartbeat_interval, self.election_timeout_min
            );
        }
        if self.election_timeout_min > self.election_timeout_max {
            warn!(
                "[{}] election timeout range [{}, {}] is inverted",
                self.me, self.election_timeout_min, self.election_timeout_max
            );
        }
        let mut seen = HashSet::new();
        for &peer in &self.peers {
            if peer == self.me || !seen.insert(peer) {
                warn!("[{}] peer list contains duplicate or own id {}", self.me, peer);
            }
        }
    }
}

/// Role-dependent volatile state. Swapping the variant on a transition
/// discards the old role's bookkeeping, so a stale vote tally or leader
/// table cannot outlive the role that owned it.
enum RoleState {
    Follower,
    Candidate {
        /// Peers (including ourselves) that granted a vote this term.
        votes: HashSet<PeerId>,
    },
    Leader {
        /// Next log index to send to each peer. Never below 1.
        next_index: HashMap<PeerId, u64>,
        /// index -> replicas (including self) known to hold it, for
        /// indices above the commit point. Ascending so commit scans run
        /// in index order.
        awaiting_commit: BTreeMap<u64, usize>,
        next_heartbeat: Instant,
    },
}

impl RoleState {
    fn role(&self) -> ServerRole {
        match self {
            RoleState::Follower => ServerRole::Follower,
            RoleState::Candidate { .. } => ServerRole::Candidate,
            RoleState::Leader { .. } => ServerRole::Leader,
        }
    }
}

/// Entry point for inbound messages. Cloned into every transport task;
/// enqueueing is the only cross-thread operation the replica supports.
#[derive(Clone)]
pub struct ReplicaHandle {
    pub(crate) tx: mpsc::Sender<RaftMessage>,
}

impl ReplicaHandle {
    /// Enqueues without blocking. Returns false if the message was dropped
    /// because the inbox is full or the replica has shut down.
    pub fn message_received(&self, message: RaftMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("inbox full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// A single Raft server: one event-loop thread owns all state, consuming
/// one inbound message or one timer expiry per iteration. Handlers are
/// synchronous; the only suspension point is the timed inbox poll.
pub struct Replica<S, M> {
    config: RaftConfig,
    storage: S,
    machine: M,
    dispatcher: Arc<dyn Dispatcher>,
    inbox: mpsc::Receiver<RaftMessage>,
    role: RoleState,
    commit_index: u64,
    current_leader: Option<PeerId>,
    /// Latest snapshot observed from the state machine.
    snapshot: Option<Snapshot>,
    election_deadline: Instant,
}

impl<S: PersistentState, M: StateMachine> Replica<S, M> {
    pub fn new(
        config: RaftConfig,
        storage: S,
        machine: M,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> (Self, ReplicaHandle) {
        config.validate();
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let snapshot = machine.latest_snapshot();
        let mut replica = Self {
            config,
            storage,
            machine,
            dispatcher,
            inbox,
            role: RoleState::Follower,
            commit_index: 0,
            current_leader: None,
            snapshot,
            election_deadline: Instant::now(),
        };
        replica.reset_election_deadline();
        (replica, ReplicaHandle { tx })
    }

    /// Runs until every handle is dropped (external shutdown) or a
    /// collaborator fails, which is fatal: the replica halts rather than
    /// continue with state it could not persist.
    pub async fn run(mut self) -> Result<Self> {
        info!(
            "[{}] replica started as follower in term {}",
            self.config.me,
            self.storage.current_term()
        );
        loop {
            let step = match timeout_at(self.poll_deadline(), self.inbox.recv()).await {
                Ok(Some(message)) => self.handle_message(message),
                Ok(None) => break,
                Err(_) => self.handle_timeout(),
            };
            if let Err(e) = step {
                error!("[{}] halting: {:#}", self.config.me, e);
                return Err(e);
            }
        }
        info!("[{}] replica shut down", self.config.me);
        Ok(self)
    }

    fn poll_deadline(&self) -> Instant {
        match &self.role {
            RoleState::Leader { next_heartbeat, .. } => *next_heartbeat,
            _ => self.election_deadline,
        }
    }

    /// One timer expiry: a leader sends its heartbeat round, everyone else
    /// starts an election.
    pub fn handle_timeout(&mut self) -> Result<()> {
        match self.role {
            RoleState::Leader { .. } => self.send_append_entries(true),
            _ => self.start_election()?,
        }
        self.apply_committed()
    }

    /// One inbound message: reconcile its term, dispatch by kind, then
    /// drain newly committed entries into the state machine.
    pub fn handle_message(&mut self, message: RaftMessage) -> Result<()> {
        self.reconcile_term(&message)?;
        match message {
            RaftMessage::RequestVote {
                source,
                term,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(source, term, last_log_index, last_log_term)?,
            RaftMessage::RequestVoteResponse {
                source,
                term,
                vote_granted,
            } => self.handle_request_vote_response(source, term, vote_granted),
            RaftMessage::AppendEntries {
                source,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                source,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            )?,
            RaftMessage::AppendEntriesResponse {
                source,
                term,
                success,
                match_index,
            } => self.handle_append_entries_response(source, term, success, match_index),
            RaftMessage::NewEntry { source, data } => self.handle_new_entry(source, data)?,
            // Replicas never consume client responses.
            RaftMessage::NewEntryResponse { .. } => {}
        }
        self.apply_committed()
    }

    // --- Term reconciliation ---

    /// Any RPC carrying a term above ours moves us to that term, clears
    /// our vote, and demotes us to follower before the handler runs.
    fn reconcile_term(&mut self, message: &RaftMessage) -> Result<()> {
        let Some(term) = message.term() else {
            return Ok(());
        };
        if term > self.storage.current_term() {
            info!(
                "[{}] observed term {} above local {}, stepping down",
                self.config.me,
                term,
                self.storage.current_term()
            );
            self.storage.set_current_term(term)?;
            self.current_leader = None;
            self.become_follower();
        }
        Ok(())
    }

    // --- Role transitions ---

    fn become_follower(&mut self) {
        // A transition to the same role is a no-op; in particular it must
        // not reset the election deadline.
        if matches!(self.role, RoleState::Follower) {
            return;
        }
        info!("[{}] becoming follower", self.config.me);
        self.role = RoleState::Follower;
        self.reset_election_deadline();
    }

    fn start_election(&mut self) -> Result<()> {
        let term = self.storage.current_term() + 1;
        self.storage.set_current_term(term)?;
        self.storage.set_voted_for(Some(self.config.me))?;
        let mut votes = HashSet::new();
        votes.insert(self.config.me);
        self.role = RoleState::Candidate { votes };
        self.reset_election_deadline();
        info!("[{}] starting election for term {}", self.config.me, term);

        let last = self.storage.last_entry();
        for &peer in &self.config.peers {
            self.dispatcher.send_request(
                peer,
                RaftMessage::RequestVote {
                    source: self.config.me,
                    term,
                    last_log_index: last.index,
                    last_log_term: last.term,
                },
            );
        }
        // A single-server cluster is its own majority.
        if self.config.majority() <= 1 {
            self.become_leader();
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        let last = self.storage.last_entry().index;
        let next_index = self.config.peers.iter().map(|&p| (p, last + 1)).collect();
        self.role = RoleState::Leader {
            next_index,
            awaiting_commit: BTreeMap::new(),
            next_heartbeat: Instant::now(),
        };
        self.current_leader = Some(self.config.me);
        info!(
            "[{}] became leader for term {}",
            self.config.me,
            self.storage.current_term()
        );
        self.send_append_entries(true);
    }

    // --- RPC handlers ---

    fn handle_request_vote(
        &mut self,
        source: PeerId,
        term: Term,
        last_log_index: u64,
        last_log_term: Term,
    ) -> Result<()> {
        let current = self.storage.current_term();
        let mut vote_granted = false;
        // After reconciliation term <= current; anything lower is stale.
        if term >= current {
            let free_to_vote = match self.storage.voted_for() {
                None => true,
                Some(v) => v == source,
            };
            let local = self.storage.last_entry();
            let log_up_to_date = last_log_term > local.term
                || (last_log_term == local.term && last_log_index >= local.index);
            if free_to_vote && log_up_to_date {
                self.storage.set_voted_for(Some(source))?;
                self.reset_election_deadline();
                vote_granted = true;
                info!("[{}] granted vote to {} for term {}", self.config.me, source, term);
            } else {
                debug!(
                    "[{}] denied vote to {} (voted_for={:?}, candidate log ({}, {}) vs local ({}, {}))",
                    self.config.me,
                    source,
                    self.storage.voted_for(),
                    last_log_term,
                    last_log_index,
                    local.term,
                    local.index
                );
            }
        }
        self.dispatcher.send_response(
            source,
            RaftMessage::RequestVoteResponse {
                source: self.config.me,
                term: current,
                vote_granted,
            },
        );
        Ok(())
    }

    fn handle_request_vote_response(&mut self, source: PeerId, term: Term, vote_granted: bool) {
        if term != self.storage.current_term() || !vote_granted {
            return;
        }
        let majority = self.config.majority();
        let won = match &mut self.role {
            RoleState::Candidate { votes } => {
                votes.insert(source);
                debug!(
                    "[{}] vote from {} ({}/{})",
                    self.config.me,
                    source,
                    votes.len(),
                    majority
                );
                votes.len() >= majority
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
    }

    fn handle_append_entries(
        &mut self,
        source: PeerId,
        term: Term,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<()> {
        let current = self.storage.current_term();
        let mut success = false;
        let mut match_index = None;
        if term >= current {
            // A live leader for our term: fall in line and hold elections off.
            self.become_follower();
            self.reset_election_deadline();
            self.current_leader = Some(source);

            if self.log_matches(prev_log_index, prev_log_term) {
                success = true;
                let last_new = prev_log_index + entries.len() as u64;
                if !entries.is_empty() {
                    debug!(
                        "[{}] appending {} entries after index {}",
                        self.config.me,
                        entries.len(),
                        prev_log_index
                    );
                    self.storage.delete_conflicting_and_append(entries)?;
                }
                match_index = Some(last_new);
                if leader_commit > self.commit_index {
                    let advanced = leader_commit.min(last_new);
                    if advanced > self.commit_index {
                        self.commit_index = advanced;
                        debug!("[{}] commit index now {}", self.config.me, advanced);
                    }
                }
            } else {
                debug!(
                    "[{}] rejecting AppendEntries from {}: no entry ({}, {}) in local log",
                    self.config.me, source, prev_log_index, prev_log_term
                );
            }
        }
        self.dispatcher.send_response(
            source,
            RaftMessage::AppendEntriesResponse {
                source: self.config.me,
                term: current,
                success,
                match_index,
            },
        );
        Ok(())
    }

    fn handle_append_entries_response(
        &mut self,
        source: PeerId,
        term: Term,
        success: bool,
        match_index: Option<u64>,
    ) {
        // Stale responses from older terms are ignored; higher terms were
        // handled by reconciliation and demoted us already.
        if term != self.storage.current_term() {
            return;
        }
        let RoleState::Leader {
            next_index,
            awaiting_commit,
            ..
        } = &mut self.role
        else {
            return;
        };
        let Some(next) = next_index.get_mut(&source) else {
            debug!("[{}] response from unknown peer {}", self.config.me, source);
            return;
        };

        let mut needs_retry = false;
        if success {
            if let Some(matched) = match_index {
                if matched >= *next {
                    // Tally the newly acknowledged range; an absent slot
                    // means only we held the entry so far.
                    for index in *next..=matched {
                        if index > self.commit_index {
                            *awaiting_commit.entry(index).or_insert(1) += 1;
                        }
                    }
                    *next = matched + 1;
                }
                // A bare heartbeat acknowledgment (matched < next) carries
                // no new replication information.
            }
        } else {
            let backed = next.saturating_sub(1).max(1);
            debug!(
                "[{}] {} rejected AppendEntries, next_index {} -> {}",
                self.config.me, source, *next, backed
            );
            *next = backed;
            needs_retry = true;
        }

        if success {
            self.advance_commit();
        }
        if needs_retry {
            // Re-probe immediately with entries from the new next_index so
            // a lagging follower converges without fresh client traffic.
            self.retry_peer(source);
        }
    }

    fn handle_new_entry(&mut self, source: PeerId, data: Vec<u8>) -> Result<()> {
        if self.role.role() != ServerRole::Leader {
            debug!(
                "[{}] redirecting client {} to {:?}",
                self.config.me, source, self.current_leader
            );
            self.dispatcher.send_response(
                source,
                RaftMessage::NewEntryResponse {
                    source: self.config.me,
                    accepted: false,
                    leader_redirect: self.current_leader,
                },
            );
            return Ok(());
        }

        let term = self.storage.current_term();
        let index = self.storage.last_entry().index + 1;
        self.storage.append(LogEntry { term, index, data })?;
        if let RoleState::Leader {
            awaiting_commit, ..
        } = &mut self.role
        {
            // The leader counts itself.
            awaiting_commit.insert(index, 1);
        }
        info!(
            "[{}] accepted client entry at index {} (term {})",
            self.config.me, index, term
        );
        self.dispatcher.send_response(
            source,
            RaftMessage::NewEntryResponse {
                source: self.config.me,
                accepted: true,
                leader_redirect: None,
            },
        );
        // A single-server cluster commits on its own acknowledgment.
        self.advance_commit();
        self.send_append_entries(false);
        Ok(())
    }

    // --- Replication driver ---

    /// One AppendEntries round to every peer. Heartbeat rounds force an
    /// empty payload regardless of each peer's next_index.
    fn send_append_entries(&mut self, heartbeat: bool) {
        let last = self.storage.last_entry().index;
        let targets: Vec<(PeerId, u64)> = match &self.role {
            RoleState::Leader { next_index, .. } => self
                .config
                .peers
                .iter()
                .map(|p| (*p, next_index.get(p).copied().unwrap_or(last + 1)))
                .collect(),
            _ => return,
        };
        for (peer, next) in targets {
            self.replicate_to(peer, next, heartbeat);
        }
        let interval = Duration::from_millis(self.config.heartbeat_interval);
        if let RoleState::Leader { next_heartbeat, .. } = &mut self.role {
            *next_heartbeat = Instant::now() + interval;
        }
    }

    fn retry_peer(&mut self, peer: PeerId) {
        let next = match &self.role {
            RoleState::Leader { next_index, .. } => match next_index.get(&peer) {
                Some(next) => *next,
                None => return,
            },
            _ => return,
        };
        self.replicate_to(peer, next, false);
    }

    fn replicate_to(&self, peer: PeerId, next: u64, heartbeat: bool) {
        let prev = next - 1;
        let Some(prev_term) = self.position_term(prev) else {
            // next_index has backed off below the compaction horizon;
            // without a snapshot installation RPC this peer cannot be
            // repaired from our log.
            warn!(
                "[{}] cannot replicate to {}: index {} was compacted away",
                self.config.me, peer, prev
            );
            return;
        };
        let entries = if heartbeat {
            Vec::new()
        } else {
            let last = self.storage.last_entry().index;
            self.storage.entries_between(next, last + 1)
        };
        debug!(
            "[{}] AppendEntries -> {} prev=({}, {}) entries={} commit={}",
            self.config.me,
            peer,
            prev,
            prev_term,
            entries.len(),
            self.commit_index
        );
        self.dispatcher.send_request(
            peer,
            RaftMessage::AppendEntries {
                source: self.config.me,
                term: self.storage.current_term(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    /// Advances the commit index over every contiguously majority-held
    /// index whose entry is from the current term. Prior-term entries
    /// commit only by being covered by a later current-term commit.
    fn advance_commit(&mut self) {
        let majority = self.config.majority();
        let current = self.storage.current_term();
        let RoleState::Leader {
            awaiting_commit, ..
        } = &mut self.role
        else {
            return;
        };
        let mut advanced = self.commit_index;
        for (&index, &acks) in awaiting_commit.iter() {
            if index <= advanced {
                continue;
            }
            if acks < majority {
                break;
            }
            match self.storage.entry(index) {
                Some(e) if e.term == current => advanced = index,
                _ => {}
            }
        }
        if advanced > self.commit_index {
            awaiting_commit.retain(|&index, _| index > advanced);
            self.commit_index = advanced;
            info!("[{}] commit index advanced to {}", self.config.me, advanced);
        }
    }

    // --- Commit applier ---

    /// Feeds committed-but-unapplied entries to the state machine, then
    /// garbage-collects the log behind any newer machine snapshot.
    fn apply_committed(&mut self) -> Result<()> {
        let applied = self.machine.last_applied_index();
        if applied < self.commit_index {
            let from = applied + 1;
            let batch = self.storage.entries_between(from, self.commit_index + 1);
            match batch.first() {
                Some(first) if first.index == from => {
                    self.machine.apply_all(&batch);
                    debug!(
                        "[{}] applied through index {}",
                        self.config.me,
                        self.machine.last_applied_index()
                    );
                }
                _ => {
                    // The entries below `from` were compacted away; the
                    // machine needs a snapshot restore we cannot provide.
                    warn!(
                        "[{}] cannot apply from index {}: entries unavailable",
                        self.config.me, from
                    );
                }
            }
        }
        if let Some(snapshot) = self.machine.latest_snapshot() {
            if snapshot.index > self.snapshot.map_or(0, |s| s.index) {
                info!(
                    "[{}] compacting log through snapshot index {}",
                    self.config.me, snapshot.index
                );
                self.storage.compact_through(snapshot)?;
                self.snapshot = Some(snapshot);
            }
        }
        Ok(())
    }

    // --- Log position helpers ---

    /// Term of the log position `index`: the sentinel, the snapshot
    /// boundary, or a live entry. None if the position was compacted away.
    fn position_term(&self, index: u64) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(snapshot) = self.snapshot {
            if snapshot.index == index {
                return Some(snapshot.term);
            }
        }
        self.storage.entry(index).map(|e| e.term)
    }

    /// The log-matching probe: do we hold `(prev_log_term, prev_log_index)`?
    /// Positions below the snapshot are committed and match by definition.
    fn log_matches(&self, prev_log_index: u64, prev_log_term: Term) -> bool {
        if let Some(snapshot) = self.snapshot {
            if prev_log_index < snapshot.index {
                return true;
            }
        }
        self.position_term(prev_log_index) == Some(prev_log_term)
    }

    fn reset_election_deadline(&mut self) {
        let lo = self.config.election_timeout_min;
        let hi = self.config.election_timeout_max.max(lo);
        let timeout = Duration::from_millis(rand::thread_rng().gen_range(lo..=hi));
        self.election_deadline = Instant::now() + timeout;
    }

    // --- Inspection ---

    pub fn role(&self) -> ServerRole {
        self.role.role()
    }

    pub fn current_term(&self) -> Term {
        self.storage.current_term()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn current_leader(&self) -> Option<PeerId> {
        self.current_leader
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }
}
