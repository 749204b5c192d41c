use crate::actor::ActorClient;
use crate::codec::AbiVersion;
use crate::log::{Index, Term};
use crate::replica::{
    MemberId, RoleChangeNotifier, RoleChangeSubscription, SubmitError, TransferLeadershipError,
};
use bytes::Bytes;
use tokio::sync::oneshot;

/// Client-facing handle to a running engine. Cheap to clone; the engine runs
/// for as long as at least one handle (or inbound transport) is alive.
#[derive(Clone)]
pub struct RaftHandle {
    member_id: MemberId,
    actor_client: ActorClient,
    notifier: RoleChangeNotifier,
}

impl RaftHandle {
    pub(crate) fn new(member_id: MemberId, actor_client: ActorClient, notifier: RoleChangeNotifier) -> Self {
        RaftHandle {
            member_id,
            actor_client,
            notifier,
        }
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// The wire/storage format version this engine speaks.
    pub fn payload_version(&self) -> AbiVersion {
        AbiVersion::CURRENT
    }

    pub(crate) fn actor_client(&self) -> &ActorClient {
        &self.actor_client
    }

    /// Submit a command for replication. Resolves once the local replica (as
    /// leader) has durably appended the entry; the returned `PendingCommit`
    /// resolves separately once the entry commits and applies.
    pub async fn submit(&self, data: Bytes) -> Result<PendingCommit, SubmitError> {
        let ok = self.actor_client.submit(data).await?;
        Ok(PendingCommit {
            term: ok.term,
            index: ok.index,
            applied: ok.applied,
        })
    }

    /// Role and leader transitions, starting with a replay of the latest
    /// known state.
    pub fn subscribe_role_changes(&self) -> RoleChangeSubscription {
        self.notifier.register()
    }

    /// Ask this replica (which must currently lead) to hand leadership to its
    /// most caught-up peer.
    pub async fn transfer_leadership(&self) -> Result<(), TransferLeadershipError> {
        self.actor_client.transfer_leadership().await
    }
}

/// The slot an accepted command occupies, plus a future for its application.
#[derive(Debug)]
pub struct PendingCommit {
    term: Term,
    index: Index,
    applied: oneshot::Receiver<Bytes>,
}

/// The entry was accepted but leadership changed before it committed. The
/// command may still commit under the new leader; the caller must re-submit
/// only if its effect is idempotent or verifiably absent.
#[derive(Debug, thiserror::Error)]
#[error("leadership was lost before the entry committed")]
pub struct CommitAbandoned;

impl PendingCommit {
    pub fn term(&self) -> Term {
        self.term
    }

    pub fn index(&self) -> Index {
        self.index
    }

    /// Waits for the entry to commit and apply, yielding the state machine's
    /// output for it.
    pub async fn applied(self) -> Result<Bytes, CommitAbandoned> {
        self.applied.await.map_err(|_| CommitAbandoned)
    }
}
