use crate::log::{Index, Term};
use crate::replica::notifier::RaftRole;
use crate::replica::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::{MemberId, MemberInfo};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// Which behavior is currently driving this replica. Shared state (term, vote,
/// log, membership) lives on the `Replica` context; only role-specific
/// volatile state lives here, so a transition is a plain value swap.
pub(crate) enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderVolatile),
}

impl Role {
    pub(crate) fn as_raft_role(&self) -> RaftRole {
        match self {
            Role::Follower(_) => RaftRole::Follower,
            Role::Candidate(_) => RaftRole::Candidate,
            Role::Leader(ls) => match ls.phase {
                LeaderPhase::Warmup { .. } => RaftRole::PreLeader,
                LeaderPhase::Steady => RaftRole::Leader,
                LeaderPhase::Isolated => RaftRole::IsolatedLeader,
            },
        }
    }
}

pub(crate) struct FollowerState {
    pub(crate) leader: Option<MemberId>,
    // None when the policy pins leadership externally.
    timer: Option<ElectionTimerHandle>,
}

impl FollowerState {
    pub(crate) fn new(leader: Option<MemberId>, timer: Option<ElectionTimerHandle>) -> Self {
        FollowerState { leader, timer }
    }

    pub(crate) fn reset_timeout(&self) {
        if let Some(timer) = &self.timer {
            timer.reset_timeout();
        }
    }
}

pub(crate) struct CandidateState {
    received_votes_from: HashSet<MemberId>,
    _timer: Option<ElectionTimerHandle>,
}

impl CandidateState {
    pub(crate) fn new(my_id: MemberId, timer: Option<ElectionTimerHandle>) -> Self {
        let mut received_votes_from = HashSet::new();
        // Candidates always vote for themselves first.
        received_votes_from.insert(my_id);
        CandidateState {
            received_votes_from,
            _timer: timer,
        }
    }

    /// Returns the number of unique votes held after recording `vote_from`.
    pub(crate) fn add_received_vote(&mut self, vote_from: MemberId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

/// Leadership has sub-phases but one pool of volatile state: per-peer progress
/// survives Warmup -> Steady promotion and Steady <-> Isolated flapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LeaderPhase {
    /// Won the election with uncommitted entries from prior terms still in the
    /// log; client submissions are refused until the backlog (plus our term's
    /// no-op) commits.
    Warmup { until_committed: Index },
    Steady,
    /// Lost contact with the majority; writes are policy-gated.
    Isolated,
}

pub(crate) struct LeaderVolatile {
    pub(crate) phase: LeaderPhase,
    pub(crate) peers: HashMap<MemberId, PeerProgress>,
}

impl LeaderVolatile {
    pub(crate) fn new(phase: LeaderPhase, peers: HashMap<MemberId, PeerProgress>) -> Self {
        LeaderVolatile { phase, peers }
    }

    pub(crate) fn peer_mut(&mut self, peer_id: &MemberId) -> Option<&mut PeerProgress> {
        self.peers.get_mut(peer_id)
    }

    pub(crate) fn matched_indexes(&self) -> Vec<Index> {
        self.peers.values().map(|p| p.matched()).collect()
    }

    /// How many cluster members (including us) we have heard from within
    /// `window`. Drives IsolatedLeader detection.
    pub(crate) fn members_in_contact(&self, now: Instant, window: tokio::time::Duration) -> usize {
        let peers_in_contact = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_contact()) <= window)
            .count();
        peers_in_contact + 1
    }

    /// The most caught-up peer, for leadership transfer.
    pub(crate) fn best_peer(&self) -> Option<&MemberId> {
        self.peers
            .iter()
            .max_by_key(|(_, progress)| progress.matched())
            .map(|(id, _)| id)
    }
}

/// Leader-private bookkeeping for one peer. Rebuilt from scratch on every
/// leadership change; never trusted across terms.
pub(crate) struct PeerProgress {
    // > index of the next log entry to send to that server
    next: Index,
    // > index of highest log entry known to be replicated on server
    matched: Index,
    last_contact: Instant,
    // Logical clock over this leader's requests to this peer; replies carrying
    // an old seq-no are dropped instead of corrupting next/matched.
    last_sent_seq_no: u64,
    last_acked_seq_no: u64,
    pub(crate) snapshot_xfer: Option<SnapshotTransfer>,
    _heartbeat: HeartbeatTimerHandle,
}

impl PeerProgress {
    pub(crate) fn new(last_log_index: Index, heartbeat: HeartbeatTimerHandle) -> Self {
        PeerProgress {
            next: last_log_index.plus(1),
            matched: Index::ZERO,
            last_contact: Instant::now(),
            last_sent_seq_no: 0,
            last_acked_seq_no: 0,
            snapshot_xfer: None,
            _heartbeat: heartbeat,
        }
    }

    pub(crate) fn next(&self) -> Index {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Index) {
        self.next = std::cmp::max(next, Index::new(1));
    }

    pub(crate) fn matched(&self) -> Index {
        self.matched
    }

    pub(crate) fn last_contact(&self) -> Instant {
        self.last_contact
    }

    pub(crate) fn mark_contact(&mut self) {
        self.last_contact = Instant::now();
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_acked_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// Returns false for stale or unknown seq-nos; such replies must be ignored.
    pub(crate) fn ratchet_acked_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_acked_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_acked_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    /// Successful replication through `match_index`.
    pub(crate) fn record_success(&mut self, match_index: Index) {
        if match_index > self.matched {
            self.matched = match_index;
        }
        self.next = std::cmp::max(self.next, self.matched.plus(1));
    }
}

/// In-progress chunked snapshot transfer to one lagging peer.
pub(crate) struct SnapshotTransfer {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    pub(crate) membership: Vec<MemberInfo>,
    data: Bytes,
    chunk_size: usize,
    offset: usize,
}

impl SnapshotTransfer {
    pub(crate) fn new(
        last_included_index: Index,
        last_included_term: Term,
        membership: Vec<MemberInfo>,
        data: Bytes,
        chunk_size: usize,
    ) -> Self {
        SnapshotTransfer {
            last_included_index,
            last_included_term,
            membership,
            data,
            chunk_size: std::cmp::max(chunk_size, 1),
            offset: 0,
        }
    }

    /// The chunk to send next. `done` marks the final chunk.
    pub(crate) fn current_chunk(&self) -> (u64, Bytes, bool) {
        let end = std::cmp::min(self.offset + self.chunk_size, self.data.len());
        let chunk = self.data.slice(self.offset..end);
        (self.offset as u64, chunk, end == self.data.len())
    }

    /// Advance past an acknowledged chunk. Returns true when the transfer is
    /// complete.
    pub(crate) fn advance(&mut self) -> bool {
        let end = std::cmp::min(self.offset + self.chunk_size, self.data.len());
        self.offset = end;
        self.offset >= self.data.len()
    }

    pub(crate) fn restart(&mut self) {
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_counts_unique_votes() {
        let mut cs = CandidateState::new(MemberId::new("me"), None);
        assert_eq!(cs.add_received_vote(MemberId::new("a")), 2);
        assert_eq!(cs.add_received_vote(MemberId::new("a")), 2);
        assert_eq!(cs.add_received_vote(MemberId::new("me")), 2);
        assert_eq!(cs.add_received_vote(MemberId::new("b")), 3);
    }

    #[test]
    fn snapshot_transfer_chunks() {
        let mut xfer = SnapshotTransfer::new(
            Index::new(10),
            Term::new(2),
            Vec::new(),
            Bytes::from_static(b"0123456789"),
            4,
        );

        let (offset, chunk, done) = xfer.current_chunk();
        assert_eq!((offset, &chunk[..], done), (0, &b"0123"[..], false));
        assert!(!xfer.advance());

        let (offset, chunk, done) = xfer.current_chunk();
        assert_eq!((offset, &chunk[..], done), (4, &b"4567"[..], false));
        assert!(!xfer.advance());

        let (offset, chunk, done) = xfer.current_chunk();
        assert_eq!((offset, &chunk[..], done), (8, &b"89"[..], true));
        assert!(xfer.advance());

        xfer.restart();
        let (offset, _, _) = xfer.current_chunk();
        assert_eq!(offset, 0);
    }

    #[test]
    fn empty_snapshot_transfer_is_single_done_chunk() {
        let xfer = SnapshotTransfer::new(Index::new(1), Term::new(1), Vec::new(), Bytes::new(), 4);
        let (offset, chunk, done) = xfer.current_chunk();
        assert_eq!(offset, 0);
        assert!(chunk.is_empty());
        assert!(done);
    }
}
