use crate::actor::{self, ReplicaActor};
use crate::api::{ConfigParams, RaftHandle, RaftOptions, StateMachine};
use crate::persist::PersistenceAdapter;
use crate::replica::{
    ClusterError, FatalError, MemberId, MemberInfo, RaftPolicy, Replica, ReplicaConfig, RoleChangeNotifier,
};
use crate::replica::ClusterTracker;
use crate::transport::PeerNetwork;
use std::convert::TryFrom;
use std::sync::Arc;

/// Everything needed to host one cluster member in this process.
pub struct EngineConfig<P, M>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    pub logger: slog::Logger,
    pub my_id: MemberId,
    pub cluster_members: Vec<MemberInfo>,
    pub persistence: P,
    pub state_machine: M,
    pub peer_network: Arc<dyn PeerNetwork>,
    pub policy: Arc<dyn RaftPolicy>,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineStartError {
    #[error("illegal engine options: {0}")]
    IllegalOptions(&'static str),
    #[error(transparent)]
    InvalidCluster(#[from] ClusterError),
    #[error("failed to recover persisted state: {0}")]
    Recovery(#[from] FatalError),
}

/// Recover durable state, spawn the replica's event loop, and return a handle
/// to it. Must be called from within a tokio runtime; the engine's timers and
/// RPC tasks live on it.
pub fn start<P, M>(config: EngineConfig<P, M>) -> Result<RaftHandle, EngineStartError>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    let params = ConfigParams::try_from(config.options).map_err(EngineStartError::IllegalOptions)?;
    let cluster_tracker = ClusterTracker::new(config.my_id.clone(), config.cluster_members)?;

    let logger = config.logger.new(slog::o!("raft_member" => config.my_id.to_string()));
    let (actor_client, inbox_rx) = actor::new_inbox(params.inbox_buffer_size);
    let notifier = RoleChangeNotifier::new();

    let replica = Replica::recover(ReplicaConfig {
        logger: logger.clone(),
        cluster_tracker,
        persistence: config.persistence,
        state_machine: config.state_machine,
        peer_network: config.peer_network,
        actor_client: actor_client.weak(),
        policy: config.policy,
        notifier: notifier.clone(),
        params,
    })?;

    let replica_actor = ReplicaActor::new(logger, inbox_rx, replica);
    tokio::task::spawn(replica_actor.run_event_loop());

    Ok(RaftHandle::new(config.my_id, actor_client, notifier))
}
