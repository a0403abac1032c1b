use crate::{LogEntry, Snapshot};
use log::debug;

/// The replicated application the commit applier feeds.
///
/// Entries arrive in index order, each exactly once. The machine decides
/// on its own when a snapshot becomes available; the replica only reads
/// the latest handle and truncates its log accordingly.
pub trait StateMachine {
    fn apply_all(&mut self, entries: &[LogEntry]);
    fn last_applied_index(&self) -> u64;
    fn latest_snapshot(&self) -> Option<Snapshot>;
}

/// Keeps every applied command in memory and, optionally, reports a
/// snapshot every `snapshot_every` applied entries. Enough machine for the
/// bundled server binary and for asserting state-machine safety in tests.
#[derive(Debug, Default)]
pub struct MemoryMachine {
    applied: Vec<LogEntry>,
    last_applied: u64,
    last_applied_term: u64,
    snapshot_every: Option<u64>,
    snapshot: Option<Snapshot>,
}

impl MemoryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A machine that reports a fresh snapshot each time another `every`
    /// entries have been applied.
    pub fn with_snapshot_every(every: u64) -> Self {
        Self {
            snapshot_every: Some(every.max(1)),
            ..Self::default()
        }
    }

    /// Everything applied so far, in order.
    pub fn applied(&self) -> &[LogEntry] {
        &self.applied
    }
}

impl StateMachine for MemoryMachine {
    fn apply_all(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            debug_assert_eq!(entry.index, self.last_applied + 1, "applied out of order");
            self.last_applied = entry.index;
            self.last_applied_term = entry.term;
            self.applied.push(entry.clone());
            if let Some(every) = self.snapshot_every {
                if self.last_applied % every == 0 {
                    debug!("machine snapshot at index {}", self.last_applied);
                    self.snapshot = Some(Snapshot {
                        index: self.last_applied,
                        term: self.last_applied_term,
                    });
                }
            }
        }
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied
    }

    fn latest_snapshot(&self) -> Option<Snapshot> {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> LogEntry {
        LogEntry {
            term: 1,
            index,
            data: vec![index as u8],
        }
    }

    #[test]
    fn applies_in_order_and_snapshots_on_cadence() {
        let mut machine = MemoryMachine::with_snapshot_every(2);
        machine.apply_all(&[entry(1), entry(2), entry(3)]);
        assert_eq!(machine.last_applied_index(), 3);
        assert_eq!(
            machine.latest_snapshot(),
            Some(Snapshot { index: 2, term: 1 })
        );
        machine.apply_all(&[entry(4)]);
        assert_eq!(
            machine.latest_snapshot(),
            Some(Snapshot { index: 4, term: 1 })
        );
    }

    #[test]
    fn no_cadence_means_no_snapshots() {
        let mut machine = MemoryMachine::new();
        machine.apply_all(&[entry(1), entry(2)]);
        assert_eq!(machine.latest_snapshot(), None);
    }
}
