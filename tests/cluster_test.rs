//! Multi-member cluster tests over the in-process loopback transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raft_engine::{
    start, AbiVersion, Command, DefaultRaftPolicy, EngineConfig, InMemoryStore, LogEntry, LoopbackTransport, MemberId,
    MemberInfo, RaftHandle, RaftOptions, RaftRole, RoleChangeEvent, StateMachine,
};
use slog::Drain;
use std::sync::{Arc, Mutex};
use tokio::time::{self, Duration};

/// Appends every applied command to a list the test can inspect from outside
/// the engine. Snapshot capture/restore round-trips the list.
#[derive(Clone)]
struct RecordingStateMachine {
    applied: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingStateMachine {
    fn new() -> Self {
        RecordingStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn applied(&self) -> Vec<Bytes> {
        self.applied.lock().unwrap().clone()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> Bytes {
        match &entry.command {
            Command::Client(data) => {
                self.applied.lock().unwrap().push(data.clone());
                data.clone()
            }
            Command::Noop => Bytes::new(),
        }
    }

    fn capture_snapshot(&self) -> Bytes {
        let applied = self.applied.lock().unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32_le(applied.len() as u32);
        for item in applied.iter() {
            buf.put_u32_le(item.len() as u32);
            buf.put_slice(item);
        }
        buf.freeze()
    }

    fn restore_snapshot(&mut self, data: Bytes) {
        let mut buf = data;
        let count = buf.get_u32_le();
        let mut applied = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = buf.get_u32_le() as usize;
            applied.push(buf.copy_to_bytes(len));
        }
        *self.applied.lock().unwrap() = applied;
    }
}

struct TestCluster {
    transport: LoopbackTransport,
    handles: Vec<RaftHandle>,
    state_machines: Vec<RecordingStateMachine>,
}

fn test_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

fn fast_options() -> RaftOptions {
    RaftOptions {
        heartbeat_interval: Some(Duration::from_millis(20)),
        election_timeout_min: Some(Duration::from_millis(100)),
        election_timeout_max: Some(Duration::from_millis(300)),
        rpc_timeout: Some(Duration::from_millis(50)),
        leader_isolation_window: Some(Duration::from_millis(200)),
        ..RaftOptions::default()
    }
}

fn start_cluster(num_members: usize, options: RaftOptions) -> TestCluster {
    let logger = test_logger();
    let transport = LoopbackTransport::new();
    let members: Vec<MemberInfo> = (0..num_members)
        .map(|i| MemberInfo {
            id: MemberId::new(format!("m-{}", i)),
            payload_version: AbiVersion::CURRENT,
        })
        .collect();

    let mut handles = Vec::new();
    let mut state_machines = Vec::new();
    for member in &members {
        let state_machine = RecordingStateMachine::new();
        let handle = start(EngineConfig {
            logger: logger.clone(),
            my_id: member.id.clone(),
            cluster_members: members.clone(),
            persistence: InMemoryStore::new(),
            state_machine: state_machine.clone(),
            peer_network: Arc::new(transport.handle_for(member.id.clone())),
            policy: Arc::new(DefaultRaftPolicy),
            options: options.clone(),
        })
        .expect("engine failed to start");
        transport.register(&handle);
        handles.push(handle);
        state_machines.push(state_machine);
    }

    TestCluster {
        transport,
        handles,
        state_machines,
    }
}

fn current_role(handle: &RaftHandle) -> Option<RaftRole> {
    // A fresh subscription replays the latest role transition.
    let mut sub = handle.subscribe_role_changes();
    let mut latest = None;
    while let Some(event) = sub.try_next() {
        if let RoleChangeEvent::Role(change) = event {
            latest = Some(change.new_role);
        }
    }
    latest
}

async fn wait_for_leader(cluster: &TestCluster, excluding: Option<usize>) -> usize {
    time::timeout(Duration::from_secs(10), async {
        loop {
            for (i, handle) in cluster.handles.iter().enumerate() {
                if Some(i) == excluding {
                    continue;
                }
                if current_role(handle) == Some(RaftRole::Leader) {
                    return i;
                }
            }
            time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("no leader elected in time")
}

async fn wait_for_role(cluster: &TestCluster, member: usize, role: RaftRole) {
    time::timeout(Duration::from_secs(10), async {
        loop {
            if current_role(&cluster.handles[member]) == Some(role) {
                return;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("member {} never reached {:?}", member, role));
}

async fn wait_for_applied(cluster: &TestCluster, member: usize, expected: &[Bytes]) {
    time::timeout(Duration::from_secs(10), async {
        loop {
            if cluster.state_machines[member].applied() == expected {
                return;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "member {} applied {:?}, expected {:?}",
            member,
            cluster.state_machines[member].applied(),
            expected
        )
    });
}

fn payload(i: usize) -> Bytes {
    Bytes::from(format!("cmd-{}", i))
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_elects_leader_and_replicates_commands() {
    let cluster = start_cluster(3, fast_options());
    let leader = wait_for_leader(&cluster, None).await;

    let mut expected = Vec::new();
    for i in 0..5 {
        let data = payload(i);
        expected.push(data.clone());
        let pending = cluster.handles[leader].submit(data.clone()).await.unwrap();
        let output = pending.applied().await.unwrap();
        assert_eq!(output, data, "leader returns the state machine output");
    }

    for member in 0..3 {
        wait_for_applied(&cluster, member, &expected).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_leader_detects_isolation_and_cluster_moves_on() {
    let cluster = start_cluster(3, fast_options());
    let old_leader = wait_for_leader(&cluster, None).await;

    let data = payload(0);
    cluster.handles[old_leader]
        .submit(data.clone())
        .await
        .unwrap()
        .applied()
        .await
        .unwrap();

    cluster.transport.detach(cluster.handles[old_leader].member_id());
    wait_for_role(&cluster, old_leader, RaftRole::IsolatedLeader).await;

    // The rest of the cluster elects a replacement and keeps committing.
    let new_leader = wait_for_leader(&cluster, Some(old_leader)).await;
    assert_ne!(new_leader, old_leader);
    let data2 = payload(1);
    cluster.handles[new_leader]
        .submit(data2.clone())
        .await
        .unwrap()
        .applied()
        .await
        .unwrap();

    // Healing the partition demotes the stale leader and catches it up.
    cluster.transport.reattach(cluster.handles[old_leader].member_id());
    wait_for_role(&cluster, old_leader, RaftRole::Follower).await;
    wait_for_applied(&cluster, old_leader, &[data, data2]).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_member_catches_up_through_snapshot_transfer() {
    let options = RaftOptions {
        snapshot_threshold_entries: Some(8),
        snapshot_retain_entries: Some(2),
        snapshot_chunk_size: Some(16),
        ..fast_options()
    };
    let cluster = start_cluster(3, options);
    let leader = wait_for_leader(&cluster, None).await;
    let lagging = (0..3).find(|i| *i != leader).unwrap();

    cluster.transport.detach(cluster.handles[lagging].member_id());

    // Enough traffic to cross the compaction threshold while one member is
    // partitioned away, forcing a snapshot transfer on heal.
    let mut expected = Vec::new();
    for i in 0..30 {
        let data = payload(i);
        expected.push(data.clone());
        cluster.handles[leader]
            .submit(data)
            .await
            .unwrap()
            .applied()
            .await
            .unwrap();
    }

    cluster.transport.reattach(cluster.handles[lagging].member_id());
    wait_for_applied(&cluster, lagging, &expected).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn leadership_transfer_moves_to_a_peer() {
    let cluster = start_cluster(3, fast_options());
    let old_leader = wait_for_leader(&cluster, None).await;

    cluster.handles[old_leader]
        .submit(payload(0))
        .await
        .unwrap()
        .applied()
        .await
        .unwrap();

    cluster.handles[old_leader].transfer_leadership().await.unwrap();

    let new_leader = wait_for_leader(&cluster, Some(old_leader)).await;
    assert_ne!(new_leader, old_leader);
    wait_for_role(&cluster, old_leader, RaftRole::Follower).await;

    // The new leader serves traffic.
    cluster.handles[new_leader]
        .submit(payload(1))
        .await
        .unwrap()
        .applied()
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_redirects_to_current_leader() {
    let cluster = start_cluster(3, fast_options());
    let leader = wait_for_leader(&cluster, None).await;
    let follower = (0..3).find(|i| *i != leader).unwrap();

    // Followers learn the leader from heartbeats; give one a moment to land.
    let leader_id = cluster.handles[leader].member_id().clone();
    let deadline = time::Instant::now() + Duration::from_secs(5);
    loop {
        match cluster.handles[follower].submit(payload(0)).await {
            Err(raft_engine::SubmitError::NotLeader { leader_hint }) => {
                if leader_hint.as_ref() == Some(&leader_id) {
                    break;
                }
            }
            Ok(_) => panic!("follower accepted a submission"),
            Err(other) => panic!("unexpected submit error: {}", other),
        }
        assert!(time::Instant::now() < deadline, "follower never learned the leader");
        time::sleep(Duration::from_millis(25)).await;
    }
}
