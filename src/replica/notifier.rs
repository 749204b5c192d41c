use crate::codec::AbiVersion;
use crate::replica::MemberId;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The role a replica currently holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    /// Newly elected leader still committing its backlog from prior terms.
    PreLeader,
    Leader,
    /// A leader that has lost contact with the cluster majority.
    IsolatedLeader,
}

/// Fire-and-forget notification of a local role transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftRoleChanged {
    pub member_id: MemberId,
    pub old_role: Option<RaftRole>,
    pub new_role: RaftRole,
}

/// Fire-and-forget notification of a change in who this replica believes the
/// leader is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderStateChanged {
    pub member_id: MemberId,
    pub leader_id: Option<MemberId>,
    pub leader_payload_version: Option<AbiVersion>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleChangeEvent {
    Role(RaftRoleChanged),
    Leader(LeaderStateChanged),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ListenerId(u64);

struct Inner {
    next_id: u64,
    // Registration order is notification order.
    listeners: Vec<(ListenerId, mpsc::UnboundedSender<RoleChangeEvent>)>,
    latest_role: Option<RaftRoleChanged>,
    latest_leader: Option<LeaderStateChanged>,
}

/// Per-engine registry of role-change listeners. A listener that registers
/// after a transition immediately receives the latest known notifications, so
/// it never waits for a transition that already happened. Delivery is over
/// unbounded channels: a slow or dead listener never blocks the replica.
#[derive(Clone)]
pub struct RoleChangeNotifier {
    inner: Arc<Mutex<Inner>>,
}

impl RoleChangeNotifier {
    pub fn new() -> Self {
        RoleChangeNotifier {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                listeners: Vec::new(),
                latest_role: None,
                latest_leader: None,
            })),
        }
    }

    pub fn register(&self) -> RoleChangeSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("role change notifier lock poisoned");
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;

        // Replay the latest known state so late registrants don't hang.
        if let Some(role) = &inner.latest_role {
            let _ = tx.send(RoleChangeEvent::Role(role.clone()));
        }
        if let Some(leader) = &inner.latest_leader {
            let _ = tx.send(RoleChangeEvent::Leader(leader.clone()));
        }

        inner.listeners.push((id, tx));

        RoleChangeSubscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn notify_role_change(&self, notification: RaftRoleChanged) {
        let mut inner = self.inner.lock().expect("role change notifier lock poisoned");
        inner.latest_role = Some(notification.clone());
        inner
            .listeners
            .retain(|(_, tx)| tx.send(RoleChangeEvent::Role(notification.clone())).is_ok());
    }

    pub(crate) fn notify_leader_change(&self, notification: LeaderStateChanged) {
        let mut inner = self.inner.lock().expect("role change notifier lock poisoned");
        inner.latest_leader = Some(notification.clone());
        inner
            .listeners
            .retain(|(_, tx)| tx.send(RoleChangeEvent::Leader(notification.clone())).is_ok());
    }

    fn unregister(inner: &Arc<Mutex<Inner>>, id: ListenerId) {
        let mut inner = inner.lock().expect("role change notifier lock poisoned");
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

impl Default for RoleChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered listener. Dropping it unregisters.
pub struct RoleChangeSubscription {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<RoleChangeEvent>,
    registry: std::sync::Weak<Mutex<Inner>>,
}

impl RoleChangeSubscription {
    /// Next notification, in the order the engine emitted them. `None` once
    /// the engine has shut down and the backlog is drained.
    pub async fn next(&mut self) -> Option<RoleChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of `next`.
    pub fn try_next(&mut self) -> Option<RoleChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for RoleChangeSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            RoleChangeNotifier::unregister(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_changed(new_role: RaftRole) -> RaftRoleChanged {
        RaftRoleChanged {
            member_id: MemberId::new("m-1"),
            old_role: Some(RaftRole::Follower),
            new_role,
        }
    }

    #[tokio::test]
    async fn late_registration_replays_latest_notification() {
        let notifier = RoleChangeNotifier::new();
        notifier.notify_role_change(role_changed(RaftRole::Candidate));
        notifier.notify_role_change(role_changed(RaftRole::Leader));
        notifier.notify_leader_change(LeaderStateChanged {
            member_id: MemberId::new("m-1"),
            leader_id: Some(MemberId::new("m-1")),
            leader_payload_version: Some(AbiVersion::CURRENT),
        });

        let mut sub = notifier.register();
        // Only the latest role notification is replayed, not the full history.
        assert_eq!(sub.next().await, Some(RoleChangeEvent::Role(role_changed(RaftRole::Leader))));
        match sub.next().await {
            Some(RoleChangeEvent::Leader(leader)) => {
                assert_eq!(leader.leader_id, Some(MemberId::new("m-1")));
            }
            other => panic!("expected leader notification, got {:?}", other),
        }
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn listeners_notified_in_registration_order() {
        let notifier = RoleChangeNotifier::new();
        let mut first = notifier.register();
        let mut second = notifier.register();

        notifier.notify_role_change(role_changed(RaftRole::Candidate));

        assert!(matches!(first.next().await, Some(RoleChangeEvent::Role(_))));
        assert!(matches!(second.next().await, Some(RoleChangeEvent::Role(_))));
    }

    #[tokio::test]
    async fn dropped_listener_does_not_block_notify() {
        let notifier = RoleChangeNotifier::new();
        let first = notifier.register();
        let mut second = notifier.register();
        drop(first);

        notifier.notify_role_change(role_changed(RaftRole::Leader));
        assert!(matches!(second.next().await, Some(RoleChangeEvent::Role(_))));
    }
}
