use crate::actor::WeakActorClient;
use crate::log::Term;
use crate::replica::MemberId;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tokio::time::{self, Duration, Instant};

/// Handle to the randomized election timer a Follower or Candidate keeps
/// armed. Dropping the handle cancels the timer (role change); resetting it
/// pushes the deadline out with fresh jitter (valid leader heartbeat).
pub(crate) struct ElectionTimerHandle {
    next_deadline: SharedDeadline,
    timeout_range: RangeInclusive<Duration>,
    _stopper: stop_signal::Stopper,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let deadline = SharedDeadline::new();
        let (stopper, stop_check) = stop_signal::new();

        let handle = ElectionTimerHandle {
            next_deadline: deadline.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            _stopper: stopper,
        };
        // Arm before the task starts, or it could fire immediately.
        handle.reset_timeout();

        tokio::task::spawn(election_timer_task(deadline, actor_client, stop_check, min_timeout));

        handle
    }

    pub(crate) fn reset_timeout(&self) {
        let jittered = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.next_deadline.replace(Instant::now() + jittered);
    }
}

async fn election_timer_task(
    deadline: SharedDeadline,
    actor_client: WeakActorClient,
    stop_check: stop_signal::StopCheck,
    retrigger_backoff: Duration,
) {
    loop {
        match deadline.take() {
            Some(wake_time) => {
                // Deadline was pushed out since we last looked; sleep to it.
                time::sleep_until(wake_time).await;
            }
            None => {
                // Slept through the deadline without a reset: no heartbeat
                // arrived. Tell the replica, then back off so a replica that
                // stays Follower (e.g. vote denied) isn't spammed.
                if stop_check.should_stop() {
                    return;
                }
                let _ = actor_client.election_timeout().await;
                time::sleep(retrigger_backoff).await;
            }
        }

        // Handle dropped: role changed, this timer generation is done.
        if stop_check.should_stop() {
            return;
        }
    }
}

/// Handle to one peer's heartbeat cadence while we are leader. The task ticks
/// eagerly once on creation so a fresh leader asserts itself before competing
/// election timers fire. Dropping the handle (leadership change) stops it.
pub(crate) struct HeartbeatTimerHandle {
    _stopper: stop_signal::Stopper,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_interval: Duration,
        actor_client: WeakActorClient,
        peer_id: MemberId,
        term: Term,
    ) -> Self {
        let (stopper, stop_check) = stop_signal::new();
        tokio::task::spawn(heartbeat_timer_task(
            heartbeat_interval,
            actor_client,
            peer_id,
            term,
            stop_check,
        ));

        HeartbeatTimerHandle { _stopper: stopper }
    }
}

async fn heartbeat_timer_task(
    heartbeat_interval: Duration,
    actor_client: WeakActorClient,
    peer_id: MemberId,
    term: Term,
    stop_check: stop_signal::StopCheck,
) {
    let mut interval = time::interval(heartbeat_interval);
    loop {
        interval.tick().await;
        if stop_check.should_stop() {
            return;
        }
        if actor_client.heartbeat_tick(peer_id.clone(), term).await.is_err() {
            return;
        }
    }
}

#[derive(Clone)]
struct SharedDeadline {
    inner: Arc<Mutex<Option<Instant>>>,
}

impl SharedDeadline {
    fn new() -> Self {
        SharedDeadline {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    fn replace(&self, deadline: Instant) {
        let mut guard = self.inner.lock().expect("election deadline lock poisoned");
        guard.replace(deadline);
    }

    fn take(&self) -> Option<Instant> {
        let mut guard = self.inner.lock().expect("election deadline lock poisoned");
        guard.take()
    }
}

/// One-shot cancellation pair for a timer generation. The timer handle owns
/// the `Stopper`; the background task polls the matching `StopCheck`.
mod stop_signal {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub(super) fn new() -> (Stopper, StopCheck) {
        let flag = Arc::new(AtomicBool::new(false));
        (Stopper(flag.clone()), StopCheck(flag))
    }

    /// Trips the flag when dropped.
    pub(super) struct Stopper(Arc<AtomicBool>);

    impl Drop for Stopper {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    pub(super) struct StopCheck(Arc<AtomicBool>);

    impl StopCheck {
        pub(super) fn should_stop(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }
}
