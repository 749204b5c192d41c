use crate::codec;
use crate::log::{Index, LogEntry};
use crate::persist::{ElectionState, PersistenceAdapter, PersistenceError, Snapshot};
use bytes::Bytes;

/// Volatile stand-in for real durable storage, for tests and in-process
/// clusters. Records are still pushed through the codec on every write and
/// read so the encoding path is exercised the same way the file store does.
pub struct InMemoryStore {
    journal: Vec<(Index, Bytes)>,
    election_state: Option<Bytes>,
    snapshot: Option<Bytes>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            journal: Vec::new(),
            election_state: None,
            snapshot: None,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceAdapter for InMemoryStore {
    fn append_to_journal(&mut self, entry: &LogEntry) -> Result<(), PersistenceError> {
        self.journal.push((entry.index, codec::encode_entry(entry)));
        Ok(())
    }

    fn truncate_journal_from(&mut self, from: Index) -> Result<(), PersistenceError> {
        self.journal.retain(|(index, _)| *index < from);
        Ok(())
    }

    fn compact_journal_through(&mut self, through: Index) -> Result<(), PersistenceError> {
        self.journal.retain(|(index, _)| *index > through);
        Ok(())
    }

    fn persist_election_state(&mut self, state: &ElectionState) -> Result<(), PersistenceError> {
        self.election_state = Some(codec::encode_election_state(state));
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        self.snapshot = Some(codec::encode_snapshot(snapshot));
        Ok(())
    }

    fn read_journal(&mut self) -> Result<Vec<LogEntry>, PersistenceError> {
        let mut entries = Vec::with_capacity(self.journal.len());
        for (_, raw) in &self.journal {
            let mut buf = raw.clone();
            entries.push(codec::decode_entry(&mut buf)?);
        }
        Ok(entries)
    }

    fn read_election_state(&mut self) -> Result<Option<ElectionState>, PersistenceError> {
        match &self.election_state {
            None => Ok(None),
            Some(raw) => {
                let mut buf = raw.clone();
                Ok(Some(codec::decode_election_state(&mut buf)?))
            }
        }
    }

    fn read_latest_snapshot(&mut self) -> Result<Option<Snapshot>, PersistenceError> {
        match &self.snapshot {
            None => Ok(None),
            Some(raw) => {
                let mut buf = raw.clone();
                Ok(Some(codec::decode_snapshot(&mut buf)?))
            }
        }
    }
}
