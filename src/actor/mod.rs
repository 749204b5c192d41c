//! Single-inbox actor hosting one replica. Every RPC, timer tick, and client
//! submission is serialized through this inbox, which is what lets the
//! replica mutate its log and election state without any internal locking.
//!
//! Disk interaction happens synchronously inside the event handler: a
//! persistence write completes before the corresponding reply callback fires,
//! which is the durability ordering the protocol depends on.

use crate::api::StateMachine;
use crate::log::Term;
use crate::persist::PersistenceAdapter;
use crate::replica::{
    AppendEntries, AppendEntriesReply, AppendEntriesReplyFromPeer, InstallSnapshot, InstallSnapshotReply,
    InstallSnapshotReplyFromPeer, MemberId, Replica, RequestVote, RequestVoteReply, RequestVoteReplyFromPeer,
    SubmitError, SubmitOk, TimeoutNow, TransferLeadershipError,
};
use bytes::Bytes;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

/// The engine has stopped (fatal persistence failure or clean shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EngineDown;

#[derive(Debug)]
pub(crate) enum Event {
    // Client command submission. Leader: append + replicate. Others: redirect.
    Submit(Bytes, Callback<Result<SubmitOk, SubmitError>>),

    // Inbound peer RPCs. Replies are infallible at this layer; protocol-level
    // rejection is encoded in the reply value itself.
    RequestVote(RequestVote, Callback<RequestVoteReply>),
    AppendEntries(AppendEntries, Callback<AppendEntriesReply>),
    InstallSnapshot(InstallSnapshot, Callback<InstallSnapshotReply>),
    TimeoutNow(TimeoutNow),

    // Completions of our own outbound RPCs, funneled back into the inbox by
    // the spawned sender tasks.
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),
    InstallSnapshotReplyFromPeer(InstallSnapshotReplyFromPeer),

    // Timer events.
    ElectionTimeout,
    HeartbeatTick { peer_id: MemberId, term: Term },

    // Administrative leadership hand-off.
    TransferLeadership(Callback<Result<(), TransferLeadershipError>>),
}

#[derive(Debug)]
pub(crate) struct Callback<T: Debug>(oneshot::Sender<T>);

impl<T: Debug> Callback<T> {
    fn send(self, message: T) {
        // Caller may have given up (e.g. RPC timeout on their side).
        let _ = self.0.send(message);
    }
}

pub(crate) fn new_inbox(buffer_size: usize) -> (ActorClient, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ActorClient { sender: tx }, rx)
}

/// Strong handle to the replica's inbox. Held by the public API handle and by
/// transports delivering inbound RPCs.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn submit(&self, data: Bytes) -> Result<SubmitOk, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::Submit(data, Callback(tx)))
            .await
            .map_err(|_| SubmitError::EngineStopped)?;
        rx.await.map_err(|_| SubmitError::EngineStopped)?
    }

    pub(crate) async fn request_vote(&self, request: RequestVote) -> Result<RequestVoteReply, EngineDown> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::RequestVote(request, Callback(tx)))
            .await
            .map_err(|_| EngineDown)?;
        rx.await.map_err(|_| EngineDown)
    }

    pub(crate) async fn append_entries(&self, request: AppendEntries) -> Result<AppendEntriesReply, EngineDown> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::AppendEntries(request, Callback(tx)))
            .await
            .map_err(|_| EngineDown)?;
        rx.await.map_err(|_| EngineDown)
    }

    pub(crate) async fn install_snapshot(&self, request: InstallSnapshot) -> Result<InstallSnapshotReply, EngineDown> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::InstallSnapshot(request, Callback(tx)))
            .await
            .map_err(|_| EngineDown)?;
        rx.await.map_err(|_| EngineDown)
    }

    pub(crate) async fn timeout_now(&self, request: TimeoutNow) -> Result<(), EngineDown> {
        self.sender.send(Event::TimeoutNow(request)).await.map_err(|_| EngineDown)
    }

    pub(crate) async fn transfer_leadership(&self) -> Result<(), TransferLeadershipError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::TransferLeadership(Callback(tx)))
            .await
            .map_err(|_| TransferLeadershipError::EngineStopped)?;
        rx.await.map_err(|_| TransferLeadershipError::EngineStopped)?
    }
}

/// Weak handle used by background tasks (timers, outbound RPC completions) so
/// they never keep a torn-down engine alive; sends to a dead engine are no-ops.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    async fn send(&self, event: Event) -> Result<(), EngineDown> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| EngineDown),
            None => Err(EngineDown),
        }
    }

    pub(crate) async fn election_timeout(&self) -> Result<(), EngineDown> {
        self.send(Event::ElectionTimeout).await
    }

    pub(crate) async fn heartbeat_tick(&self, peer_id: MemberId, term: Term) -> Result<(), EngineDown> {
        self.send(Event::HeartbeatTick { peer_id, term }).await
    }

    pub(crate) async fn notify_request_vote_reply(&self, reply: RequestVoteReplyFromPeer) -> Result<(), EngineDown> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply(&self, reply: AppendEntriesReplyFromPeer) -> Result<(), EngineDown> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply(
        &self,
        reply: InstallSnapshotReplyFromPeer,
    ) -> Result<(), EngineDown> {
        self.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }
}

/// Drains the inbox and feeds the replica, one event at a time.
pub(crate) struct ReplicaActor<P, M>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<P, M>,
}

impl<P, M> ReplicaActor<P, M>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<P, M>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Err(fatal) = self.handle_event(event) {
                // A replica that cannot persist must not vote or acknowledge
                // writes. Stop consuming the inbox; callers observe EngineDown.
                slog::crit!(self.logger, "Replica halting: {}", fatal);
                return;
            }
        }
    }

    // Must NOT be async: long-running work belongs on spawned tasks that
    // report back through the inbox.
    fn handle_event(&mut self, event: Event) -> Result<(), crate::replica::FatalError> {
        match event {
            Event::Submit(data, callback) => {
                let result = self.replica.handle_submit(data)?;
                callback.send(result);
            }
            Event::RequestVote(request, callback) => {
                let reply = self.replica.handle_request_vote(request)?;
                callback.send(reply);
            }
            Event::AppendEntries(request, callback) => {
                let reply = self.replica.handle_append_entries(request)?;
                callback.send(reply);
            }
            Event::InstallSnapshot(request, callback) => {
                let reply = self.replica.handle_install_snapshot(request)?;
                callback.send(reply);
            }
            Event::TimeoutNow(request) => {
                self.replica.handle_timeout_now(request)?;
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply(reply)?;
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply(reply)?;
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply(reply)?;
            }
            Event::ElectionTimeout => {
                self.replica.handle_election_timeout()?;
            }
            Event::HeartbeatTick { peer_id, term } => {
                self.replica.handle_heartbeat_tick(peer_id, term)?;
            }
            Event::TransferLeadership(callback) => {
                let result = self.replica.handle_transfer_leadership();
                callback.send(result);
            }
        }
        Ok(())
    }
}
