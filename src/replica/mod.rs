mod notifier;
mod peers;
mod policy;
mod replica;
mod role;
mod rpc;
mod snapshot;
mod timers;

pub use notifier::{
    LeaderStateChanged, RaftRole, RaftRoleChanged, RoleChangeEvent, RoleChangeNotifier, RoleChangeSubscription,
};
pub use peers::{ClusterError, ClusterTracker, MemberId, MemberInfo};
pub use policy::{DefaultRaftPolicy, RaftPolicy};
pub use replica::{FatalError, SubmitError, SubmitOk, TransferLeadershipError};
pub use rpc::{
    AppendEntries, AppendEntriesReply, AppendOutcome, ConflictHint, InstallSnapshot, InstallSnapshotReply,
    RequestVote, RequestVoteReply, TimeoutNow,
};

pub(crate) use replica::{
    AppendEntriesReplyFromPeer, InstallSnapshotReplyFromPeer, Replica, ReplicaConfig, RequestVoteReplyFromPeer,
};
