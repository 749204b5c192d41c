use crate::actor::ActorClient;
use crate::api::RaftHandle;
use crate::codec::AbiVersion;
use crate::replica::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, MemberId, RequestVote,
    RequestVoteReply, TimeoutNow,
};
use crate::transport::{PeerNetwork, RpcError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Endpoint {
    actor_client: ActorClient,
    payload_version: AbiVersion,
    attached: bool,
}

/// In-process transport connecting engines in the same runtime. Used by the
/// integration tests and by single-process multi-replica setups. `detach`
/// simulates a network partition around one member.
#[derive(Clone)]
pub struct LoopbackTransport {
    registry: Arc<Mutex<HashMap<MemberId, Endpoint>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make `handle`'s engine reachable by the other members on this transport.
    pub fn register(&self, handle: &RaftHandle) {
        self.register_raw(handle.member_id().clone(), handle.payload_version(), handle.actor_client().clone());
    }

    pub(crate) fn register_raw(&self, member_id: MemberId, payload_version: AbiVersion, actor_client: ActorClient) {
        let mut registry = self.registry.lock().expect("loopback registry lock poisoned");
        registry.insert(
            member_id,
            Endpoint {
                actor_client,
                payload_version,
                attached: true,
            },
        );
    }

    /// Sever all traffic to and from `member_id` until `reattach`.
    pub fn detach(&self, member_id: &MemberId) {
        self.set_attached(member_id, false);
    }

    pub fn reattach(&self, member_id: &MemberId) {
        self.set_attached(member_id, true);
    }

    fn set_attached(&self, member_id: &MemberId, attached: bool) {
        let mut registry = self.registry.lock().expect("loopback registry lock poisoned");
        if let Some(endpoint) = registry.get_mut(member_id) {
            endpoint.attached = attached;
        }
    }

    /// The `PeerNetwork` view for one sending member.
    pub fn handle_for(&self, sender: MemberId) -> LoopbackHandle {
        LoopbackHandle {
            sender,
            registry: self.registry.clone(),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's sending side of a `LoopbackTransport`.
#[derive(Clone)]
pub struct LoopbackHandle {
    sender: MemberId,
    registry: Arc<Mutex<HashMap<MemberId, Endpoint>>>,
}

impl LoopbackHandle {
    /// Version and partition checks happen before delivery, under the
    /// registry lock. The returned client is used after the lock is dropped.
    fn route_to(&self, target: &MemberId) -> Result<ActorClient, RpcError> {
        let registry = self.registry.lock().expect("loopback registry lock poisoned");

        let unreachable = || RpcError::Unreachable(target.clone());
        let sender = registry.get(&self.sender).ok_or_else(unreachable)?;
        if !sender.attached {
            return Err(unreachable());
        }
        let endpoint = registry.get(target).ok_or_else(unreachable)?;
        if !endpoint.attached {
            return Err(unreachable());
        }

        // Mixed-version clusters fail loudly at the exchange, in either
        // direction, instead of misreading payloads later.
        sender.payload_version.check()?;
        endpoint.payload_version.check()?;

        Ok(endpoint.actor_client.clone())
    }
}

#[async_trait]
impl PeerNetwork for LoopbackHandle {
    async fn request_vote(&self, peer: &MemberId, request: RequestVote) -> Result<RequestVoteReply, RpcError> {
        let client = self.route_to(peer)?;
        client.request_vote(request).await.map_err(|_| RpcError::Unreachable(peer.clone()))
    }

    async fn append_entries(&self, peer: &MemberId, request: AppendEntries) -> Result<AppendEntriesReply, RpcError> {
        let client = self.route_to(peer)?;
        client.append_entries(request).await.map_err(|_| RpcError::Unreachable(peer.clone()))
    }

    async fn install_snapshot(
        &self,
        peer: &MemberId,
        request: InstallSnapshot,
    ) -> Result<InstallSnapshotReply, RpcError> {
        let client = self.route_to(peer)?;
        client.install_snapshot(request).await.map_err(|_| RpcError::Unreachable(peer.clone()))
    }

    async fn timeout_now(&self, peer: &MemberId, request: TimeoutNow) -> Result<(), RpcError> {
        let client = self.route_to(peer)?;
        client.timeout_now(request).await.map_err(|_| RpcError::Unreachable(peer.clone()))
    }
}
