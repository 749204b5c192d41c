use bytes::Bytes;
use std::fmt;

/// Term is raft's monotonic logical clock. At most one leader holds any given term.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index is a 1-based position of an entry in the replicated log. `Index::ZERO`
/// is the sentinel for "no entry" (empty log, no snapshot, nothing matched yet).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index(u64);

impl Index {
    pub const ZERO: Index = Index(0);

    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index(self.0 + delta)
    }

    /// Previous index, saturating at the empty sentinel.
    pub fn prev(&self) -> Index {
        Index(self.0.saturating_sub(1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The payload carried by a log entry. `Noop` entries are appended internally
/// by a newly elected leader to establish commitment of its term; they are
/// replicated and counted for quorum but never reach the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Noop,
    Client(Bytes),
}

impl Command {
    pub fn len(&self) -> usize {
        match self {
            Command::Noop => 0,
            Command::Client(data) => data.len(),
        }
    }
}

/// A single replicated log record. Immutable once appended; removed only by
/// conflict truncation (uncommitted suffix) or snapshot compaction (applied prefix).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub command: Command,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        assert_eq!(Index::ZERO.prev(), Index::ZERO);
        assert_eq!(Index::new(1).prev(), Index::ZERO);
        assert_eq!(Index::new(5).plus(3), Index::new(8));
        assert!(Index::new(2) < Index::new(10));
    }

    #[test]
    fn term_ordering() {
        assert!(Term::ZERO < Term::new(1));
        assert_eq!(Term::new(4).next(), Term::new(5));
    }
}
