use crate::log::{Command, Index, LogEntry, Term};
use std::collections::VecDeque;

/// ReplicatedLog is the in-memory window of the raft log: everything after the
/// last snapshot compaction point, plus the commit/apply cursors.
///
/// Invariants:
/// - entries are contiguous in index from `snapshot_index + 1`
/// - `commit_index <= last_index()`
/// - `last_applied <= commit_index`, except on a node running with the
///   pre-consensus-apply policy enabled
pub struct ReplicatedLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: Index,
    snapshot_term: Term,
    commit_index: Index,
    last_applied: Index,
    // Running total of command payload bytes in `entries`.
    retained_bytes: u64,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::from_snapshot(Index::ZERO, Term::ZERO)
    }

    /// Start from a compaction point. Used at bootstrap (ZERO/ZERO), after
    /// restart recovery, and when installing a snapshot received from a leader.
    pub fn from_snapshot(snapshot_index: Index, snapshot_term: Term) -> Self {
        ReplicatedLog {
            entries: VecDeque::new(),
            snapshot_index,
            snapshot_term,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            retained_bytes: 0,
        }
    }

    pub fn snapshot_index(&self) -> Index {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    pub fn last_index(&self) -> Index {
        self.snapshot_index.plus(self.entries.len() as u64)
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn retained_len(&self) -> usize {
        self.entries.len()
    }

    pub fn retained_bytes(&self) -> u64 {
        self.retained_bytes
    }

    fn pos(&self, index: Index) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index() {
            None
        } else {
            Some((index.as_u64() - self.snapshot_index.as_u64() - 1) as usize)
        }
    }

    pub fn entry(&self, index: Index) -> Option<&LogEntry> {
        self.pos(index).map(|p| &self.entries[p])
    }

    /// Term of the entry at `index`, answering the compaction boundary and the
    /// empty-log sentinel as well. `None` means the index is either beyond the
    /// tail or compacted away (and not the boundary itself).
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index.is_zero() {
            Some(Term::ZERO)
        } else if index == self.snapshot_index {
            Some(self.snapshot_term)
        } else {
            self.entry(index).map(|e| e.term)
        }
    }

    /// Leader-side append: assigns the next index.
    pub fn append(&mut self, term: Term, command: Command) -> LogEntry {
        let entry = LogEntry {
            term,
            index: self.last_index().plus(1),
            command,
        };
        self.retained_bytes += entry.command.len() as u64;
        self.entries.push_back(entry.clone());
        entry
    }

    /// Follower-side append of an entry received from the leader. The caller
    /// has already resolved conflicts; the index must be the next one.
    pub fn append_entry(&mut self, entry: LogEntry) {
        assert_eq!(
            entry.index,
            self.last_index().plus(1),
            "log entries must stay contiguous"
        );
        self.retained_bytes += entry.command.len() as u64;
        self.entries.push_back(entry);
    }

    /// Removes `index` and everything after it. Only uncommitted entries may
    /// ever be truncated.
    pub fn truncate_from(&mut self, index: Index) {
        assert!(
            index > self.commit_index,
            "attempted to truncate committed entries (from {:?}, commit {:?})",
            index,
            self.commit_index
        );
        if let Some(p) = self.pos(index) {
            let dropped = self.entries.split_off(p);
            for e in &dropped {
                self.retained_bytes -= e.command.len() as u64;
            }
        }
    }

    /// Copies out up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<LogEntry> {
        let mut out = Vec::new();
        let mut index = from;
        while out.len() < max {
            match self.entry(index) {
                Some(e) => out.push(e.clone()),
                None => break,
            }
            index = index.plus(1);
        }
        out
    }

    /// Moves `commit_index` forward, clamped to the log tail. Never moves backward.
    pub fn ratchet_commit_index(&mut self, new_commit_index: Index) {
        let clamped = std::cmp::min(new_commit_index, self.last_index());
        if clamped > self.commit_index {
            self.commit_index = clamped;
        }
    }

    /// Returns the next committed-but-unapplied entry, advancing the apply
    /// cursor. Drives the apply loop on leader and followers alike.
    pub fn take_next_to_apply(&mut self) -> Option<LogEntry> {
        if self.last_applied >= self.commit_index {
            return None;
        }
        let next = self.last_applied.plus(1);
        let entry = self.entry(next).cloned();
        if entry.is_some() {
            self.last_applied = next;
        }
        entry
    }

    /// Pre-consensus-apply support: marks everything through `index` as already
    /// applied, even ahead of the commit index.
    pub fn force_applied_through(&mut self, index: Index) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }

    /// Drops all retained entries at or below `through` and moves the
    /// compaction markers. `through` must already be applied.
    pub fn compact_through(&mut self, through: Index) {
        if through <= self.snapshot_index {
            return;
        }
        assert!(
            through <= self.last_applied,
            "cannot compact unapplied entries (through {:?}, applied {:?})",
            through,
            self.last_applied
        );
        let boundary_term = self.term_at(through).expect("compaction boundary must be in the log");
        while let Some(front) = self.entries.front() {
            if front.index > through {
                break;
            }
            self.retained_bytes -= front.command.len() as u64;
            self.entries.pop_front();
        }
        self.snapshot_index = through;
        self.snapshot_term = boundary_term;
    }

    /// First retained index carrying `term`. Conflict-hint support.
    pub fn first_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Last retained index carrying `term`. Conflict-hint support.
    pub fn last_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }
}
