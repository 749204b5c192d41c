use crate::log::{Index, ReplicatedLog, Term};
use crate::persist::{PersistenceAdapter, PersistenceError, Snapshot};
use bytes::{Bytes, BytesMut};

/// Snapshot lifecycle for one replica: decides when the retained log has grown
/// enough to compact, persists captured snapshots, and keeps the latest one in
/// memory so the leader can stream it to lagging peers without a disk read.
pub(crate) struct SnapshotManager {
    logger: slog::Logger,
    compaction_threshold_entries: usize,
    compaction_threshold_bytes: u64,
    retain_entries: usize,
    chunk_size: usize,
    latest: Option<Snapshot>,
}

impl SnapshotManager {
    pub(crate) fn new(
        logger: slog::Logger,
        compaction_threshold_entries: usize,
        compaction_threshold_bytes: u64,
        retain_entries: usize,
        chunk_size: usize,
        recovered: Option<Snapshot>,
    ) -> Self {
        SnapshotManager {
            logger,
            compaction_threshold_entries,
            compaction_threshold_bytes,
            retain_entries,
            chunk_size,
            latest: recovered,
        }
    }

    pub(crate) fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// True when the retained log has crossed either compaction threshold and
    /// there is applied state to fold into a snapshot.
    pub(crate) fn should_capture(&self, log: &ReplicatedLog) -> bool {
        if log.last_applied() <= log.snapshot_index() {
            return false;
        }
        log.retained_len() >= self.compaction_threshold_entries
            || log.retained_bytes() >= self.compaction_threshold_bytes
    }

    /// Persist a freshly captured snapshot, then compact the journal and the
    /// in-memory log behind it. The persistence write happens first so a crash
    /// between the two steps only costs us redundant journal entries, never
    /// applied state. Compaction stops `retain_entries` short of the snapshot
    /// point, keeping a tail of older entries so peers lagging slightly behind
    /// the snapshot are still served plain AppendEntries.
    pub(crate) fn capture<P: PersistenceAdapter>(
        &mut self,
        snapshot: Snapshot,
        persistence: &mut P,
        log: &mut ReplicatedLog,
    ) -> Result<(), PersistenceError> {
        let boundary = Index::new(
            snapshot
                .last_included_index
                .as_u64()
                .saturating_sub(self.retain_entries as u64),
        );
        persistence.save_snapshot(&snapshot)?;
        persistence.compact_journal_through(boundary)?;
        log.compact_through(boundary);

        slog::info!(
            self.logger, "Captured snapshot";
            "last_included_index" => snapshot.last_included_index.as_u64(),
            "last_included_term" => snapshot.last_included_term.as_u64(),
            "data_bytes" => snapshot.data.len(),
        );
        self.latest = Some(snapshot);
        Ok(())
    }

    /// Record a snapshot installed from a leader as our latest.
    pub(crate) fn installed(&mut self, snapshot: Snapshot) {
        self.latest = Some(snapshot);
    }
}

/// Follower-side accumulator for one in-flight chunked snapshot transfer.
/// Chunks must arrive in order; an out-of-order chunk fails the transfer and
/// the leader restarts it from offset zero.
pub(crate) struct InstallBuffer {
    last_included_index: Index,
    last_included_term: Term,
    received: BytesMut,
}

impl InstallBuffer {
    pub(crate) fn new(last_included_index: Index, last_included_term: Term) -> Self {
        InstallBuffer {
            last_included_index,
            last_included_term,
            received: BytesMut::new(),
        }
    }

    /// Whether this buffer belongs to the transfer identified by the given
    /// compaction point.
    pub(crate) fn matches(&self, last_included_index: Index, last_included_term: Term) -> bool {
        self.last_included_index == last_included_index && self.last_included_term == last_included_term
    }

    /// Append the next chunk. Returns false if `offset` is not exactly where
    /// the previous chunk left off.
    pub(crate) fn accept_chunk(&mut self, offset: u64, chunk: &Bytes) -> bool {
        if offset != self.received.len() as u64 {
            return false;
        }
        self.received.extend_from_slice(chunk);
        true
    }

    pub(crate) fn into_data(self) -> Bytes {
        self.received.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Command, Term};
    use crate::persist::InMemoryStore;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn applied_log(num_entries: u64) -> ReplicatedLog {
        let mut log = ReplicatedLog::new();
        for _ in 0..num_entries {
            log.append(Term::new(1), Command::Client(Bytes::from_static(b"abc")));
        }
        log.ratchet_commit_index(Index::new(num_entries));
        while log.take_next_to_apply().is_some() {}
        log
    }

    #[test]
    fn capture_trips_on_entry_threshold() {
        let mgr = SnapshotManager::new(test_logger(), 3, u64::MAX, 0, 1024, None);
        assert!(!mgr.should_capture(&applied_log(2)));
        assert!(mgr.should_capture(&applied_log(3)));
    }

    #[test]
    fn capture_trips_on_byte_threshold() {
        // 3 bytes of payload per entry.
        let mgr = SnapshotManager::new(test_logger(), usize::MAX, 7, 0, 1024, None);
        assert!(!mgr.should_capture(&applied_log(2)));
        assert!(mgr.should_capture(&applied_log(3)));
    }

    #[test]
    fn no_capture_without_applied_entries() {
        let mgr = SnapshotManager::new(test_logger(), 1, 1, 0, 1024, None);
        let mut log = ReplicatedLog::new();
        log.append(Term::new(1), Command::Client(Bytes::from_static(b"abc")));
        // Appended but not committed/applied.
        assert!(!mgr.should_capture(&log));
    }

    #[test]
    fn capture_compacts_log_and_retains_latest() {
        let mut mgr = SnapshotManager::new(test_logger(), 3, u64::MAX, 0, 1024, None);
        let mut log = applied_log(4);
        let mut store = InMemoryStore::new();

        let snapshot = Snapshot {
            last_included_index: log.last_applied(),
            last_included_term: Term::new(1),
            data: Bytes::from_static(b"sm-state"),
            membership: Vec::new(),
        };
        mgr.capture(snapshot.clone(), &mut store, &mut log).unwrap();

        assert_eq!(log.snapshot_index(), Index::new(4));
        assert_eq!(log.retained_len(), 0);
        assert_eq!(mgr.latest(), Some(&snapshot));
        assert_eq!(store.read_latest_snapshot().unwrap(), Some(snapshot));
    }

    #[test]
    fn capture_keeps_a_retained_tail_below_the_snapshot_point() {
        let mut mgr = SnapshotManager::new(test_logger(), 8, u64::MAX, 2, 1024, None);
        let mut log = applied_log(10);
        let mut store = InMemoryStore::new();

        let snapshot = Snapshot {
            last_included_index: log.last_applied(),
            last_included_term: Term::new(1),
            data: Bytes::from_static(b"sm-state"),
            membership: Vec::new(),
        };
        mgr.capture(snapshot, &mut store, &mut log).unwrap();

        // Compacted through 8; entries 9 and 10 stay to serve lagging peers.
        assert_eq!(log.snapshot_index(), Index::new(8));
        assert_eq!(log.retained_len(), 2);
        assert!(log.entry(Index::new(9)).is_some());
    }

    #[test]
    fn install_buffer_enforces_chunk_order() {
        let mut buf = InstallBuffer::new(Index::new(5), Term::new(2));
        assert!(buf.accept_chunk(0, &Bytes::from_static(b"0123")));
        assert!(!buf.accept_chunk(8, &Bytes::from_static(b"89")), "gap rejected");
        assert!(!buf.accept_chunk(0, &Bytes::from_static(b"0123")), "replay rejected");
        assert!(buf.accept_chunk(4, &Bytes::from_static(b"45")));
        assert_eq!(&buf.into_data()[..], b"012345");
    }
}
