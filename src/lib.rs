//! A transport-agnostic raft consensus engine. Each cluster member hosts one
//! replica behind a single-task event loop; applications plug in a
//! `StateMachine` for semantics, a `PersistenceAdapter` for durability, and a
//! `PeerNetwork` for the wire.

mod actor;
mod api;
mod codec;
mod log;
mod persist;
mod replica;
mod transport;

pub use api::start;
pub use api::CommitAbandoned;
pub use api::ConfigParams;
pub use api::EngineConfig;
pub use api::EngineStartError;
pub use api::PendingCommit;
pub use api::RaftHandle;
pub use api::RaftOptions;
pub use api::StateMachine;

pub use log::Command;
pub use log::Index;
pub use log::LogEntry;
pub use log::Term;

pub use persist::ElectionState;
pub use persist::FileStore;
pub use persist::InMemoryStore;
pub use persist::PersistenceAdapter;
pub use persist::PersistenceError;
pub use persist::Snapshot;

pub use codec::AbiError;
pub use codec::AbiVersion;
pub use codec::CodecError;

pub use replica::AppendEntries;
pub use replica::AppendEntriesReply;
pub use replica::AppendOutcome;
pub use replica::ClusterError;
pub use replica::ConflictHint;
pub use replica::DefaultRaftPolicy;
pub use replica::FatalError;
pub use replica::InstallSnapshot;
pub use replica::InstallSnapshotReply;
pub use replica::LeaderStateChanged;
pub use replica::MemberId;
pub use replica::MemberInfo;
pub use replica::RaftPolicy;
pub use replica::RaftRole;
pub use replica::RaftRoleChanged;
pub use replica::RequestVote;
pub use replica::RequestVoteReply;
pub use replica::RoleChangeEvent;
pub use replica::RoleChangeSubscription;
pub use replica::SubmitError;
pub use replica::TimeoutNow;
pub use replica::TransferLeadershipError;

pub use transport::LoopbackHandle;
pub use transport::LoopbackTransport;
pub use transport::PeerNetwork;
pub use transport::RpcError;
