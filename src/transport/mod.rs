//! Transport seam. The engine core never opens a socket; it hands fully
//! formed protocol messages to a `PeerNetwork` implementation and receives
//! replies as plain values. Deployments bring their own wire stack; the
//! in-process loopback here covers tests and single-process clusters.

mod loopback;

pub use loopback::{LoopbackHandle, LoopbackTransport};

use crate::codec::AbiError;
use crate::replica::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, MemberId, RequestVote,
    RequestVoteReply, TimeoutNow,
};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer {0} is unreachable")]
    Unreachable(MemberId),
    #[error("rpc timed out")]
    Timeout,
    #[error("peer speaks an incompatible wire version: {0}")]
    Incompatible(#[from] AbiError),
}

/// Point-to-point messaging between cluster members. Implementations must be
/// cheap to clone behind an `Arc` and safe to call from many tasks at once;
/// the engine spawns one task per in-flight RPC.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    async fn request_vote(&self, peer: &MemberId, request: RequestVote) -> Result<RequestVoteReply, RpcError>;

    async fn append_entries(&self, peer: &MemberId, request: AppendEntries) -> Result<AppendEntriesReply, RpcError>;

    async fn install_snapshot(
        &self,
        peer: &MemberId,
        request: InstallSnapshot,
    ) -> Result<InstallSnapshotReply, RpcError>;

    async fn timeout_now(&self, peer: &MemberId, request: TimeoutNow) -> Result<(), RpcError>;
}
