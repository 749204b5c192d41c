//! Transport-agnostic peer messages. Transports carry these verbatim; the
//! replica's event loop dispatches on the concrete message type.

use crate::log::{Index, LogEntry, Term};
use crate::replica::MemberId;
use bytes::Bytes;

/// Candidate soliciting a vote for `term`.
#[derive(Clone, Debug)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Leader replicating entries (or heartbeating, when `entries` is empty).
#[derive(Clone, Debug)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: MemberId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Index,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub outcome: AppendOutcome,
}

#[derive(Clone, Debug)]
pub enum AppendOutcome {
    /// Entries persisted; follower log now matches the leader through `match_index`.
    Success { match_index: Index },
    /// prev entry check failed; hint tells the leader where to resume.
    Conflict(ConflictHint),
    /// The calling leader's term is behind; it must step down.
    StaleTerm,
}

/// Where the follower's log diverges. `term` is the follower's term at the
/// conflicting slot and `index` that term's first index, letting the leader
/// jump its `next` cursor back a whole term at a time instead of one entry per
/// round trip. `term` is ZERO when the follower has no entry there at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictHint {
    pub index: Index,
    pub term: Term,
}

/// One chunk of a snapshot transfer to a follower that has fallen behind the
/// leader's compaction point.
#[derive(Clone, Debug)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    /// Byte offset of `chunk` within the snapshot data.
    pub offset: u64,
    pub chunk: Bytes,
    pub done: bool,
    /// Cluster membership at the time the snapshot was taken. Sent with the
    /// final chunk only.
    pub membership: Vec<crate::replica::MemberInfo>,
}

#[derive(Clone, Debug)]
pub struct InstallSnapshotReply {
    pub term: Term,
    /// False asks the leader to restart the transfer from offset 0.
    pub success: bool,
}

/// Administrative request to start an election immediately, bypassing the
/// election timer. Sent by a leader handing off leadership.
#[derive(Clone, Debug)]
pub struct TimeoutNow {
    pub term: Term,
    pub leader_id: MemberId,
}
