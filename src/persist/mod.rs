mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use crate::codec::CodecError;
use crate::log::{Index, LogEntry, Term};
use crate::replica::{MemberId, MemberInfo};
use bytes::Bytes;
use std::io;

/// The durable term/vote record. Written before any vote or AppendEntries
/// reply leaves this replica, so a crash-restart can never double-vote or
/// acknowledge entries it no longer has.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionState {
    pub current_term: Term,
    pub voted_for: Option<MemberId>,
}

impl ElectionState {
    pub fn initial() -> Self {
        ElectionState {
            current_term: Term::ZERO,
            voted_for: None,
        }
    }
}

/// A compacted representation of all applied state up to `last_included_index`.
/// Supersedes every log entry at or below that index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub data: Bytes,
    pub membership: Vec<MemberInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage IO failure: {0}")]
    Io(#[from] io::Error),
    #[error("persisted record is unreadable: {0}")]
    Codec(#[from] CodecError),
}

/// Durable storage for everything raft requires to survive a crash-restart:
/// the journal of log entries, the election term/vote record, and snapshots.
///
/// Every write method must only return once the data is durable; the engine
/// acknowledges RPCs on the strength of these return values. Any error is
/// fatal to the hosting replica.
///
/// Called synchronously from the replica's event-loop task.
pub trait PersistenceAdapter: Send + 'static {
    fn append_to_journal(&mut self, entry: &LogEntry) -> Result<(), PersistenceError>;

    /// Remove journal entries with `index >= from`. Follower conflict resolution.
    fn truncate_journal_from(&mut self, from: Index) -> Result<(), PersistenceError>;

    /// Remove journal entries with `index <= through`. Snapshot compaction.
    fn compact_journal_through(&mut self, through: Index) -> Result<(), PersistenceError>;

    fn persist_election_state(&mut self, state: &ElectionState) -> Result<(), PersistenceError>;

    /// Durably record `snapshot`, superseding any previously saved snapshot.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError>;

    /// Journal contents in index order. Restart recovery only.
    fn read_journal(&mut self) -> Result<Vec<LogEntry>, PersistenceError>;

    fn read_election_state(&mut self) -> Result<Option<ElectionState>, PersistenceError>;

    fn read_latest_snapshot(&mut self) -> Result<Option<Snapshot>, PersistenceError>;
}
