use crate::{LogEntry, PeerId, Snapshot, Term};
use anyhow::{ensure, Context, Result};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Durable per-replica state: current term, vote, and the log.
///
/// All mutators persist before returning; a mutator error means the
/// backing store could no longer be written and the replica must halt
/// rather than continue with possibly divergent state. Reads are served
/// from memory and are infallible.
pub trait PersistentState {
    fn current_term(&self) -> Term;
    /// Also clears `voted_for`; a vote belongs to exactly one term.
    fn set_current_term(&mut self, term: Term) -> Result<()>;

    fn voted_for(&self) -> Option<PeerId>;
    fn set_voted_for(&mut self, peer: Option<PeerId>) -> Result<()>;

    /// Last entry of the log, or the sentinel `(term 0, index 0)` when the
    /// log is empty. After compaction the base snapshot position stands in
    /// for the sentinel so prev pointers and vote comparisons stay correct.
    fn last_entry(&self) -> LogEntry;
    fn entry(&self, index: u64) -> Option<LogEntry>;
    /// Entries with `from <= index < to`, in index order. Indices at or
    /// below the compaction base are silently absent.
    fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry>;

    /// Appends one entry; its index must be exactly `last_entry().index + 1`.
    fn append(&mut self, entry: LogEntry) -> Result<()>;
    /// Truncates any local suffix that conflicts with the batch (same index,
    /// different term) and appends whatever of the batch is missing.
    /// The batch must be contiguous and ascending.
    fn delete_conflicting_and_append(&mut self, entries: Vec<LogEntry>) -> Result<()>;
    /// Drops all entries with `index <= snapshot.index`; the snapshot
    /// position becomes the new log base.
    fn compact_through(&mut self, snapshot: Snapshot) -> Result<()>;
}

/// In-memory store. The unit of truth for log bookkeeping; `FileStore`
/// wraps it with durability.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryStore {
    current_term: Term,
    voted_for: Option<PeerId>,
    /// Contiguous tail of the log; `entries[0].index == base.index + 1`.
    entries: Vec<LogEntry>,
    /// Position everything before the tail was compacted into.
    /// `(0, 0)` until the first compaction.
    base: Snapshot,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            entries: Vec::new(),
            base: Snapshot { index: 0, term: 0 },
        }
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.base.index {
            return None;
        }
        let off = (index - self.base.index - 1) as usize;
        (off < self.entries.len()).then_some(off)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentState for MemoryStore {
    fn current_term(&self) -> Term {
        self.current_term
    }

    fn set_current_term(&mut self, term: Term) -> Result<()> {
        ensure!(
            term >= self.current_term,
            "term must not decrease ({} -> {})",
            self.current_term,
            term
        );
        if term > self.current_term {
            self.voted_for = None;
        }
        self.current_term = term;
        Ok(())
    }

    fn voted_for(&self) -> Option<PeerId> {
        self.voted_for
    }

    fn set_voted_for(&mut self, peer: Option<PeerId>) -> Result<()> {
        self.voted_for = peer;
        Ok(())
    }

    fn last_entry(&self) -> LogEntry {
        self.entries.last().cloned().unwrap_or(LogEntry {
            term: self.base.term,
            index: self.base.index,
            data: Vec::new(),
        })
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.offset(index).map(|off| self.entries[off].clone())
    }

    fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let from = from.max(self.base.index + 1);
        if from >= to {
            return Vec::new();
        }
        let last = self.last_entry().index;
        let to = to.min(last + 1);
        (from..to)
            .filter_map(|i| self.offset(i))
            .map(|off| self.entries[off].clone())
            .collect()
    }

    fn append(&mut self, entry: LogEntry) -> Result<()> {
        let last = self.last_entry().index;
        ensure!(
            entry.index == last + 1,
            "non-contiguous append: index {} after {}",
            entry.index,
            last
        );
        self.entries.push(entry);
        Ok(())
    }

    fn delete_conflicting_and_append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        for entry in entries {
            if entry.index <= self.base.index {
                // Compacted, hence committed: matches by definition.
                continue;
            }
            match self.offset(entry.index) {
                Some(off) if self.entries[off].term == entry.term => {}
                Some(off) => {
                    // Conflict: drop this entry and the whole suffix after it.
                    self.entries.truncate(off);
                    self.entries.push(entry);
                }
                None => self.append(entry)?,
            }
        }
        Ok(())
    }

    fn compact_through(&mut self, snapshot: Snapshot) -> Result<()> {
        ensure!(
            snapshot.index <= self.last_entry().index,
            "snapshot index {} is beyond the log",
            snapshot.index
        );
        if snapshot.index <= self.base.index {
            return Ok(());
        }
        self.entries.retain(|e| e.index > snapshot.index);
        self.base = snapshot;
        Ok(())
    }
}

/// File-backed store: the whole `MemoryStore` is rewritten with bincode on
/// every mutation, so a restarted replica resumes with the term, vote, and
/// log it last persisted.
pub struct FileStore {
    inner: MemoryStore,
    path: PathBuf,
}

impl FileStore {
    /// Opens the store at `path`, loading any previously persisted state.
    /// A missing file means a fresh replica; a corrupt file is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = match fs::read(&path) {
            Ok(bytes) => {
                let store: MemoryStore = bincode::deserialize(&bytes)
                    .with_context(|| format!("corrupt state file {}", path.display()))?;
                info!(
                    "loaded persisted state from {}: term={}, voted_for={:?}, {} log entries",
                    path.display(),
                    store.current_term,
                    store.voted_for,
                    store.entries.len()
                );
                store
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryStore::new(),
            Err(e) => {
                error!("failed to read state from {}: {}", path.display(), e);
                return Err(e.into());
            }
        };
        Ok(Self { inner, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let bytes = bincode::serialize(&self.inner)?;
        fs::write(&self.path, bytes)
            .with_context(|| format!("failed to write state to {}", self.path.display()))
    }
}

impl PersistentState for FileStore {
    fn current_term(&self) -> Term {
        self.inner.current_term()
    }

    fn set_current_term(&mut self, term: Term) -> Result<()> {
        self.inner.set_current_term(term)?;
        self.persist()
    }

    fn voted_for(&self) -> Option<PeerId> {
        self.inner.voted_for()
    }

    fn set_voted_for(&mut self, peer: Option<PeerId>) -> Result<()> {
        self.inner.set_voted_for(peer)?;
        self.persist()
    }

    fn last_entry(&self) -> LogEntry {
        self.inner.last_entry()
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.inner.entry(index)
    }

    fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        self.inner.entries_between(from, to)
    }

    fn append(&mut self, entry: LogEntry) -> Result<()> {
        self.inner.append(entry)?;
        self.persist()
    }

    fn delete_conflicting_and_append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        self.inner.delete_conflicting_and_append(entries)?;
        self.persist()
    }

    fn compact_through(&mut self, snapshot: Snapshot) -> Result<()> {
        self.inner.compact_through(snapshot)?;
        self.persist()
    }
}
