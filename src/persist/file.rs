use crate::codec;
use crate::log::{Index, LogEntry};
use crate::persist::{ElectionState, PersistenceAdapter, PersistenceError, Snapshot};
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const JOURNAL_FILE: &str = "journal.bin";
const ELECTION_FILE: &str = "election.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Directory-backed PersistenceAdapter. The journal is a flat file of
/// length-prefixed codec frames; election state and the latest snapshot are
/// single-record files replaced atomically via write-to-temp + rename.
///
/// Writes fsync before returning, which is what lets the replica acknowledge
/// votes and AppendEntries on the strength of a completed call.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, PersistenceError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_record_file(&self, name: &str, record: &[u8]) -> Result<(), PersistenceError> {
        let tmp = self.path(&format!("{}.tmp", name));
        let mut file = File::create(&tmp)?;
        file.write_all(record)?;
        file.sync_all()?;
        fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    fn read_record_file(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(self.path(name)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_journal_frames(&self) -> Result<Vec<LogEntry>, PersistenceError> {
        let raw = match self.read_record_file(JOURNAL_FILE)? {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };

        let mut entries = Vec::new();
        let mut remaining = &raw[..];
        while !remaining.is_empty() {
            if remaining.len() < 4 {
                return Err(codec::CodecError::Truncated("journal frame length").into());
            }
            let mut len_bytes = [0u8; 4];
            remaining.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if remaining.len() < len {
                return Err(codec::CodecError::Truncated("journal frame").into());
            }
            let mut frame = Bytes::copy_from_slice(&remaining[..len]);
            remaining = &remaining[len..];
            entries.push(codec::decode_entry(&mut frame)?);
        }

        Ok(entries)
    }

    fn rewrite_journal(&self, entries: &[LogEntry]) -> Result<(), PersistenceError> {
        let mut raw = Vec::new();
        for entry in entries {
            let frame = codec::encode_entry(entry);
            raw.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            raw.extend_from_slice(&frame);
        }
        self.write_record_file(JOURNAL_FILE, &raw)
    }
}

impl PersistenceAdapter for FileStore {
    fn append_to_journal(&mut self, entry: &LogEntry) -> Result<(), PersistenceError> {
        let frame = codec::encode_entry(entry);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(JOURNAL_FILE))?;
        file.write_all(&(frame.len() as u32).to_le_bytes())?;
        file.write_all(&frame)?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate_journal_from(&mut self, from: Index) -> Result<(), PersistenceError> {
        let mut entries = self.read_journal_frames()?;
        entries.retain(|e| e.index < from);
        self.rewrite_journal(&entries)
    }

    fn compact_journal_through(&mut self, through: Index) -> Result<(), PersistenceError> {
        let mut entries = self.read_journal_frames()?;
        entries.retain(|e| e.index > through);
        self.rewrite_journal(&entries)
    }

    fn persist_election_state(&mut self, state: &ElectionState) -> Result<(), PersistenceError> {
        self.write_record_file(ELECTION_FILE, &codec::encode_election_state(state))
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        self.write_record_file(SNAPSHOT_FILE, &codec::encode_snapshot(snapshot))
    }

    fn read_journal(&mut self) -> Result<Vec<LogEntry>, PersistenceError> {
        self.read_journal_frames()
    }

    fn read_election_state(&mut self) -> Result<Option<ElectionState>, PersistenceError> {
        match self.read_record_file(ELECTION_FILE)? {
            None => Ok(None),
            Some(raw) => {
                let mut buf = Bytes::from(raw);
                Ok(Some(codec::decode_election_state(&mut buf)?))
            }
        }
    }

    fn read_latest_snapshot(&mut self) -> Result<Option<Snapshot>, PersistenceError> {
        match self.read_record_file(SNAPSHOT_FILE)? {
            None => Ok(None),
            Some(raw) => {
                let mut buf = Bytes::from(raw);
                Ok(Some(codec::decode_snapshot(&mut buf)?))
            }
        }
    }
}
