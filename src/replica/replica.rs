use crate::actor::WeakActorClient;
use crate::api::{ConfigParams, StateMachine};
use crate::log::{Command, Index, ReplicatedLog, Term};
use crate::persist::{ElectionState, PersistenceAdapter, PersistenceError, Snapshot};
use crate::replica::notifier::{LeaderStateChanged, RaftRoleChanged, RoleChangeNotifier};
use crate::replica::role::{
    CandidateState, FollowerState, LeaderPhase, LeaderVolatile, PeerProgress, Role, SnapshotTransfer,
};
use crate::replica::rpc::{
    AppendEntries, AppendEntriesReply, AppendOutcome, ConflictHint, InstallSnapshot, InstallSnapshotReply,
    RequestVote, RequestVoteReply, TimeoutNow,
};
use crate::replica::snapshot::{InstallBuffer, SnapshotManager};
use crate::replica::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::{ClusterTracker, MemberId, RaftPolicy};
use crate::transport::{PeerNetwork, RpcError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

/// Unrecoverable replica failure. A replica that cannot persist must stop
/// participating; its event loop halts on the first occurrence.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Successful submission: the command holds slot (`term`, `index`) and
/// `applied` resolves with the state machine output once the entry commits
/// and applies. The sender is dropped on leadership loss, which surfaces to
/// the caller as an abandoned commit.
#[derive(Debug)]
pub struct SubmitOk {
    pub term: Term,
    pub index: Index,
    pub applied: oneshot::Receiver<Bytes>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("this replica is not the leader")]
    NotLeader { leader_hint: Option<MemberId> },
    #[error("leader is still committing entries from prior terms")]
    LeaderNotReady,
    #[error("leader has lost contact with the cluster majority")]
    NoMajority,
    #[error("engine has stopped")]
    EngineStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferLeadershipError {
    #[error("this replica is not the leader")]
    NotLeader,
    #[error("no peer to transfer leadership to")]
    NoPeers,
    #[error("engine has stopped")]
    EngineStopped,
}

/// Completion of an outbound RequestVote call, funneled back into the inbox.
#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: MemberId,
    /// Term the request was sent in.
    pub(crate) term: Term,
    pub(crate) result: Result<RequestVoteReply, RpcError>,
}

/// Completion of an outbound AppendEntries call.
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) peer_id: MemberId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) result: Result<AppendEntriesReply, RpcError>,
}

/// Completion of an outbound InstallSnapshot call.
#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: MemberId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) result: Result<InstallSnapshotReply, RpcError>,
}

struct PendingApply {
    term: Term,
    tx: oneshot::Sender<Bytes>,
}

pub(crate) struct ReplicaConfig<P, M>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) persistence: P,
    pub(crate) state_machine: M,
    pub(crate) peer_network: Arc<dyn PeerNetwork>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) policy: Arc<dyn RaftPolicy>,
    pub(crate) notifier: RoleChangeNotifier,
    pub(crate) params: ConfigParams,
}

/// The consensus state machine for one cluster member. All methods run on the
/// hosting actor's event-loop task; `&mut self` is the whole concurrency story.
pub(crate) struct Replica<P, M>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    logger: slog::Logger,
    my_id: MemberId,
    cluster_tracker: ClusterTracker,
    persistence: P,
    state_machine: M,
    log: ReplicatedLog,
    election_state: ElectionState,
    role: Role,
    snapshots: SnapshotManager,
    install_buffer: Option<InstallBuffer>,
    peer_network: Arc<dyn PeerNetwork>,
    actor_client: WeakActorClient,
    policy: Arc<dyn RaftPolicy>,
    notifier: RoleChangeNotifier,
    params: ConfigParams,
    pending_applies: HashMap<u64, PendingApply>,
    published_leader: Option<MemberId>,
}

impl<P, M> Replica<P, M>
where
    P: PersistenceAdapter,
    M: StateMachine,
{
    /// Build a replica from durable state, replaying any snapshot and journal
    /// left by a previous process incarnation. Always starts as Follower.
    pub(crate) fn recover(mut config: ReplicaConfig<P, M>) -> Result<Self, FatalError> {
        let my_id = config.cluster_tracker.my_id().clone();

        let recovered_snapshot = config.persistence.read_latest_snapshot()?;
        let mut log = match &recovered_snapshot {
            Some(snapshot) => {
                config.state_machine.restore_snapshot(snapshot.data.clone());
                ReplicatedLog::from_snapshot(snapshot.last_included_index, snapshot.last_included_term)
            }
            None => ReplicatedLog::new(),
        };

        // Journal entries at or below the snapshot point can linger after a
        // crash between snapshot save and journal compaction. Skip them.
        for entry in config.persistence.read_journal()? {
            if entry.index > log.snapshot_index() {
                log.append_entry(entry);
            }
        }

        let election_state = config
            .persistence
            .read_election_state()?
            .unwrap_or_else(ElectionState::initial);

        slog::info!(
            config.logger, "Recovered replica state";
            "current_term" => election_state.current_term.as_u64(),
            "snapshot_index" => log.snapshot_index().as_u64(),
            "last_index" => log.last_index().as_u64(),
        );

        let snapshots = SnapshotManager::new(
            config.logger.clone(),
            config.params.snapshot_threshold_entries,
            config.params.snapshot_threshold_bytes,
            config.params.snapshot_retain_entries,
            config.params.snapshot_chunk_size,
            recovered_snapshot,
        );

        let election_timer = Self::new_election_timer(&config.policy, &config.params, &config.actor_client);
        let role = Role::Follower(FollowerState::new(None, election_timer));

        config.notifier.notify_role_change(RaftRoleChanged {
            member_id: my_id.clone(),
            old_role: None,
            new_role: role.as_raft_role(),
        });

        Ok(Replica {
            logger: config.logger,
            my_id,
            cluster_tracker: config.cluster_tracker,
            persistence: config.persistence,
            state_machine: config.state_machine,
            log,
            election_state,
            role,
            snapshots,
            install_buffer: None,
            peer_network: config.peer_network,
            actor_client: config.actor_client,
            policy: config.policy,
            notifier: config.notifier,
            params: config.params,
            pending_applies: HashMap::new(),
            published_leader: None,
        })
    }

    fn new_election_timer(
        policy: &Arc<dyn RaftPolicy>,
        params: &ConfigParams,
        actor_client: &WeakActorClient,
    ) -> Option<ElectionTimerHandle> {
        if policy.automatic_elections_enabled() {
            Some(ElectionTimerHandle::spawn_timer_task(
                params.election_timeout_min,
                params.election_timeout_max,
                actor_client.clone(),
            ))
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Client submission
    // ------------------------------------------------------------------

    pub(crate) fn handle_submit(&mut self, data: Bytes) -> Result<Result<SubmitOk, SubmitError>, FatalError> {
        let apply_before_consensus = self.policy.apply_modification_to_state_before_consensus();
        match &self.role {
            Role::Follower(fs) => {
                return Ok(Err(SubmitError::NotLeader {
                    leader_hint: fs.leader.clone(),
                }))
            }
            Role::Candidate(_) => return Ok(Err(SubmitError::NotLeader { leader_hint: None })),
            Role::Leader(ls) => match ls.phase {
                LeaderPhase::Warmup { .. } => return Ok(Err(SubmitError::LeaderNotReady)),
                LeaderPhase::Isolated if !apply_before_consensus => {
                    return Ok(Err(SubmitError::NoMajority))
                }
                _ => {}
            },
        }

        let term = self.election_state.current_term;
        let entry = self.log.append(term, Command::Client(data));
        self.persistence.append_to_journal(&entry)?;

        let (tx, rx) = oneshot::channel();
        let index = entry.index;

        if apply_before_consensus {
            // Degraded-topology mode: apply now, acknowledge now. Quorum
            // replication still proceeds in the background.
            let output = self.state_machine.apply(&entry);
            self.log.force_applied_through(index);
            let _ = tx.send(output);
        } else {
            self.pending_applies.insert(index.as_u64(), PendingApply { term, tx });
        }

        // Single-member cluster commits on its own.
        if self.cluster_tracker.num_members() == 1 {
            self.advance_commit_if_quorum()?;
        }

        Ok(Ok(SubmitOk {
            term,
            index,
            applied: rx,
        }))
    }

    // ------------------------------------------------------------------
    // Inbound RPCs
    // ------------------------------------------------------------------

    pub(crate) fn handle_request_vote(&mut self, request: RequestVote) -> Result<RequestVoteReply, FatalError> {
        if !self.cluster_tracker.contains(&request.candidate_id) {
            slog::warn!(self.logger, "Vote request from unknown member {}", request.candidate_id);
            return Ok(RequestVoteReply {
                term: self.election_state.current_term,
                vote_granted: false,
            });
        }

        // > Reply false if term < currentTerm
        if request.term < self.election_state.current_term {
            slog::info!(
                self.logger,
                "Not granting vote to {}: candidate term {:?} is behind ours {:?}",
                request.candidate_id,
                request.term,
                self.election_state.current_term,
            );
            return Ok(RequestVoteReply {
                term: self.election_state.current_term,
                vote_granted: false,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower
        if request.term > self.election_state.current_term {
            self.become_follower(request.term, None)?;
        }

        let already_voted_for_other = match &self.election_state.voted_for {
            Some(voted_for) => *voted_for != request.candidate_id,
            None => false,
        };
        if already_voted_for_other {
            slog::info!(
                self.logger,
                "Not granting vote to {}: already voted for {:?} in term {:?}",
                request.candidate_id,
                self.election_state.voted_for,
                self.election_state.current_term,
            );
            return Ok(RequestVoteReply {
                term: self.election_state.current_term,
                vote_granted: false,
            });
        }

        if !self.candidate_log_is_up_to_date(request.last_log_term, request.last_log_index) {
            slog::info!(self.logger, "Not granting vote to {}: candidate log is behind", request.candidate_id);
            return Ok(RequestVoteReply {
                term: self.election_state.current_term,
                vote_granted: false,
            });
        }

        // Grant. The vote is durable before the reply leaves this replica.
        self.update_election_state(ElectionState {
            current_term: self.election_state.current_term,
            voted_for: Some(request.candidate_id.clone()),
        })?;
        if let Role::Follower(fs) = &self.role {
            fs.reset_timeout();
        }
        slog::info!(
            self.logger,
            "Voting for {} in term {:?}",
            request.candidate_id,
            self.election_state.current_term
        );

        Ok(RequestVoteReply {
            term: self.election_state.current_term,
            vote_granted: true,
        })
    }

    /// > If the logs have last entries with different terms, then the log with
    /// > the later term is more up-to-date. If the logs end with the same term,
    /// > then whichever log is longer is more up-to-date.
    fn candidate_log_is_up_to_date(&self, candidate_last_term: Term, candidate_last_index: Index) -> bool {
        let my_last_term = self.log.last_term();
        if candidate_last_term != my_last_term {
            return candidate_last_term > my_last_term;
        }
        candidate_last_index >= self.log.last_index()
    }

    pub(crate) fn handle_append_entries(&mut self, request: AppendEntries) -> Result<AppendEntriesReply, FatalError> {
        if request.term < self.election_state.current_term {
            return Ok(AppendEntriesReply {
                term: self.election_state.current_term,
                outcome: AppendOutcome::StaleTerm,
            });
        }

        // Valid leader for this term (or newer). Whatever we were, we are its
        // follower now.
        self.acknowledge_leader(request.term, request.leader_id.clone())?;

        // Consistency check on the entry preceding the batch.
        if request.prev_log_index > self.log.last_index() {
            return Ok(AppendEntriesReply {
                term: self.election_state.current_term,
                outcome: AppendOutcome::Conflict(ConflictHint {
                    index: self.log.last_index().plus(1),
                    term: Term::ZERO,
                }),
            });
        }
        match self.log.term_at(request.prev_log_index) {
            None => {
                // Below our compaction point: everything there is committed
                // and identical on every replica by definition.
                return Ok(AppendEntriesReply {
                    term: self.election_state.current_term,
                    outcome: AppendOutcome::Success {
                        match_index: self.log.snapshot_index(),
                    },
                });
            }
            Some(term) if term != request.prev_log_term => {
                // Hint with the first index of the conflicting term so the
                // leader can rewind a whole term per round trip.
                let hint_index = self
                    .log
                    .first_index_of_term(term)
                    .unwrap_or_else(|| self.log.snapshot_index().plus(1));
                return Ok(AppendEntriesReply {
                    term: self.election_state.current_term,
                    outcome: AppendOutcome::Conflict(ConflictHint {
                        index: hint_index,
                        term,
                    }),
                });
            }
            Some(_) => {}
        }

        // > If an existing entry conflicts with a new one (same index but
        // > different terms), delete the existing entry and all that follow it.
        let mut match_index = request.prev_log_index;
        for entry in request.entries {
            match self.log.term_at(entry.index) {
                Some(existing_term) if existing_term == entry.term => {
                    // Already have it (leader retry). Keep ours.
                }
                Some(_) => {
                    self.persistence.truncate_journal_from(entry.index)?;
                    self.log.truncate_from(entry.index);
                    self.persistence.append_to_journal(&entry)?;
                    self.log.append_entry(entry.clone());
                }
                None => {
                    self.persistence.append_to_journal(&entry)?;
                    self.log.append_entry(entry.clone());
                }
            }
            match_index = entry.index;
        }

        // Commit no further than this exchange proved matching. Anything we
        // retain past `match_index` may be a stale divergent suffix the leader
        // has not checked yet.
        self.log
            .ratchet_commit_index(std::cmp::min(request.leader_commit, match_index));
        self.apply_committed_entries();
        self.maybe_capture_snapshot()?;

        Ok(AppendEntriesReply {
            term: self.election_state.current_term,
            outcome: AppendOutcome::Success { match_index },
        })
    }

    pub(crate) fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshot,
    ) -> Result<InstallSnapshotReply, FatalError> {
        if request.term < self.election_state.current_term {
            return Ok(InstallSnapshotReply {
                term: self.election_state.current_term,
                success: false,
            });
        }
        self.acknowledge_leader(request.term, request.leader_id.clone())?;

        // Stale transfer for state we already hold.
        if request.last_included_index <= self.log.snapshot_index() {
            return Ok(InstallSnapshotReply {
                term: self.election_state.current_term,
                success: true,
            });
        }

        if request.offset == 0 {
            self.install_buffer = Some(InstallBuffer::new(
                request.last_included_index,
                request.last_included_term,
            ));
        }
        let accepted = match &mut self.install_buffer {
            Some(buffer) if buffer.matches(request.last_included_index, request.last_included_term) => {
                buffer.accept_chunk(request.offset, &request.chunk)
            }
            _ => false,
        };
        if !accepted {
            // Out-of-order chunk or a transfer we never saw the start of.
            // Ask the leader to restart from offset zero.
            self.install_buffer = None;
            return Ok(InstallSnapshotReply {
                term: self.election_state.current_term,
                success: false,
            });
        }

        if request.done {
            let buffer = self.install_buffer.take().unwrap_or_else(|| {
                // Unreachable: accepted implies the buffer exists.
                InstallBuffer::new(request.last_included_index, request.last_included_term)
            });
            let snapshot = Snapshot {
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                data: buffer.into_data(),
                membership: request.membership,
            };

            self.persistence.save_snapshot(&snapshot)?;
            self.persistence.compact_journal_through(snapshot.last_included_index)?;
            self.persistence
                .truncate_journal_from(snapshot.last_included_index.plus(1))?;

            // The snapshot supersedes the entire retained log.
            self.state_machine.restore_snapshot(snapshot.data.clone());
            self.log = ReplicatedLog::from_snapshot(snapshot.last_included_index, snapshot.last_included_term);
            slog::info!(
                self.logger, "Installed snapshot from leader";
                "last_included_index" => snapshot.last_included_index.as_u64(),
                "last_included_term" => snapshot.last_included_term.as_u64(),
            );
            self.snapshots.installed(snapshot);
        }

        Ok(InstallSnapshotReply {
            term: self.election_state.current_term,
            success: true,
        })
    }

    pub(crate) fn handle_timeout_now(&mut self, request: TimeoutNow) -> Result<(), FatalError> {
        if request.term < self.election_state.current_term {
            return Ok(());
        }
        if matches!(self.role, Role::Leader(_)) {
            return Ok(());
        }
        slog::info!(self.logger, "Leadership hand-off from {}; starting election now", request.leader_id);
        // Bypasses the election timer and any policy pinning: the current
        // leader explicitly asked for this.
        self.start_election()
    }

    // ------------------------------------------------------------------
    // Replies to our own outbound RPCs
    // ------------------------------------------------------------------

    pub(crate) fn handle_request_vote_reply(&mut self, reply: RequestVoteReplyFromPeer) -> Result<(), FatalError> {
        if reply.term != self.election_state.current_term {
            return Ok(());
        }

        let vote_reply = match reply.result {
            Ok(vote_reply) => vote_reply,
            Err(rpc_err) => {
                // No retry here. If the election stalls, the candidate's own
                // election timer fires again with a fresh term.
                slog::debug!(self.logger, "RequestVote to {} failed: {}", reply.peer_id, rpc_err);
                return Ok(());
            }
        };

        if vote_reply.term > self.election_state.current_term {
            return self.become_follower(vote_reply.term, None);
        }
        if !vote_reply.vote_granted {
            slog::info!(self.logger, "Vote denied by {} for term {:?}", reply.peer_id, reply.term);
            return Ok(());
        }

        let votes = match &mut self.role {
            Role::Candidate(cs) => cs.add_received_vote(reply.peer_id),
            // Vote arrived after this election already resolved.
            _ => return Ok(()),
        };
        slog::info!(
            self.logger,
            "Received {}/{} votes for term {:?}",
            votes,
            self.cluster_tracker.num_members(),
            reply.term,
        );
        if votes >= self.cluster_tracker.majority() {
            self.become_leader()?;
        }
        Ok(())
    }

    pub(crate) fn handle_append_entries_reply(&mut self, reply: AppendEntriesReplyFromPeer) -> Result<(), FatalError> {
        if reply.term != self.election_state.current_term {
            return Ok(());
        }
        let ls = match &mut self.role {
            Role::Leader(ls) => ls,
            _ => return Ok(()),
        };
        let progress = match ls.peer_mut(&reply.peer_id) {
            Some(progress) => progress,
            None => return Ok(()),
        };
        if !progress.ratchet_acked_seq_no(reply.seq_no) {
            return Ok(());
        }

        let ae_reply = match reply.result {
            Ok(ae_reply) => ae_reply,
            Err(rpc_err) => {
                slog::debug!(self.logger, "AppendEntries to {} failed: {}", reply.peer_id, rpc_err);
                return Ok(());
            }
        };
        progress.mark_contact();

        if ae_reply.term > self.election_state.current_term {
            return self.become_follower(ae_reply.term, None);
        }

        match ae_reply.outcome {
            AppendOutcome::Success { match_index } => {
                progress.record_success(match_index);
                self.advance_commit_if_quorum()?;
            }
            AppendOutcome::Conflict(hint) => {
                // Jump the cursor back a whole term where we can.
                let new_next = if hint.term != Term::ZERO {
                    match self.log.last_index_of_term(hint.term) {
                        Some(index) => index.plus(1),
                        None => hint.index,
                    }
                } else {
                    hint.index
                };
                slog::info!(
                    self.logger,
                    "Log conflict with {}: rewinding next to {:?} (hint {:?})",
                    reply.peer_id,
                    new_next,
                    hint,
                );
                progress.set_next(new_next);
            }
            AppendOutcome::StaleTerm => {
                // Reply term should exceed ours in this case; handled above.
                // Reaching here means the follower saw a newer term that has
                // since been superseded. Nothing to do.
            }
        }
        Ok(())
    }

    pub(crate) fn handle_install_snapshot_reply(
        &mut self,
        reply: InstallSnapshotReplyFromPeer,
    ) -> Result<(), FatalError> {
        if reply.term != self.election_state.current_term {
            return Ok(());
        }
        let ls = match &mut self.role {
            Role::Leader(ls) => ls,
            _ => return Ok(()),
        };
        let progress = match ls.peer_mut(&reply.peer_id) {
            Some(progress) => progress,
            None => return Ok(()),
        };
        if !progress.ratchet_acked_seq_no(reply.seq_no) {
            return Ok(());
        }

        let is_reply = match reply.result {
            Ok(is_reply) => is_reply,
            Err(rpc_err) => {
                // Current chunk is re-sent on the next heartbeat tick.
                slog::debug!(self.logger, "InstallSnapshot to {} failed: {}", reply.peer_id, rpc_err);
                return Ok(());
            }
        };
        progress.mark_contact();

        if is_reply.term > self.election_state.current_term {
            return self.become_follower(is_reply.term, None);
        }

        if let Some(xfer) = &mut progress.snapshot_xfer {
            if !is_reply.success {
                slog::info!(self.logger, "Peer {} asked for snapshot transfer restart", reply.peer_id);
                xfer.restart();
            } else if xfer.advance() {
                let caught_up_through = xfer.last_included_index;
                progress.snapshot_xfer = None;
                progress.record_success(caught_up_through);
                slog::info!(
                    self.logger,
                    "Snapshot transfer to {} complete through index {:?}",
                    reply.peer_id,
                    caught_up_through,
                );
                self.advance_commit_if_quorum()?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timer events
    // ------------------------------------------------------------------

    pub(crate) fn handle_election_timeout(&mut self) -> Result<(), FatalError> {
        match self.role {
            Role::Leader(_) => Ok(()),
            _ => {
                slog::info!(self.logger, "Election timeout; starting election");
                self.start_election()
            }
        }
    }

    pub(crate) fn handle_heartbeat_tick(&mut self, peer_id: MemberId, term: Term) -> Result<(), FatalError> {
        if term != self.election_state.current_term {
            return Ok(());
        }
        if !matches!(self.role, Role::Leader(_)) {
            return Ok(());
        }

        self.check_leader_isolation();

        let ls = match &mut self.role {
            Role::Leader(ls) => ls,
            _ => return Ok(()),
        };
        let progress = match ls.peer_mut(&peer_id) {
            Some(progress) => progress,
            None => return Ok(()),
        };
        if progress.has_outstanding_request() {
            // A reply or timeout is guaranteed to come back; don't pile on.
            return Ok(());
        }

        if progress.snapshot_xfer.is_some() {
            self.send_snapshot_chunk(peer_id);
        } else if progress.next() <= self.log.snapshot_index() {
            self.begin_snapshot_transfer(peer_id);
        } else {
            self.send_append_entries(peer_id);
        }
        Ok(())
    }

    fn check_leader_isolation(&mut self) {
        let majority = self.cluster_tracker.majority();
        let window = self.params.leader_isolation_window;
        let old_role = self.role.as_raft_role();
        let ls = match &mut self.role {
            Role::Leader(ls) => ls,
            _ => return,
        };
        let in_contact = ls.members_in_contact(Instant::now(), window);

        let new_phase = match ls.phase {
            LeaderPhase::Steady if in_contact < majority => LeaderPhase::Isolated,
            LeaderPhase::Isolated if in_contact >= majority => LeaderPhase::Steady,
            phase => phase,
        };
        if new_phase != ls.phase {
            slog::warn!(
                self.logger,
                "Leader contact with {}/{} members; transitioning {:?} -> {:?}",
                in_contact,
                self.cluster_tracker.num_members(),
                ls.phase,
                new_phase,
            );
            ls.phase = new_phase;
            self.publish_role_change(old_role);
        }
    }

    // ------------------------------------------------------------------
    // Outbound RPC dispatch
    // ------------------------------------------------------------------

    fn send_append_entries(&mut self, peer_id: MemberId) {
        let term = self.election_state.current_term;
        let prev_log_index;
        let entries;
        {
            let ls = match &mut self.role {
                Role::Leader(ls) => ls,
                _ => return,
            };
            let progress = match ls.peer_mut(&peer_id) {
                Some(progress) => progress,
                None => return,
            };
            prev_log_index = progress.next().prev();
            entries = self.log.entries_from(progress.next(), self.params.append_batch_size);
        }
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(prev_log_term) => prev_log_term,
            // Peer's cursor fell behind our compaction point between checks.
            None => return self.begin_snapshot_transfer(peer_id),
        };

        let request = AppendEntries {
            term,
            leader_id: self.my_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.log.commit_index(),
        };

        let seq_no = match self.leader_peer_mut(&peer_id) {
            Some(progress) => progress.next_seq_no(),
            None => return,
        };
        tokio::task::spawn(call_peer_append_entries(
            self.peer_network.clone(),
            self.actor_client.clone(),
            peer_id,
            request,
            seq_no,
            self.params.rpc_timeout,
        ));
    }

    fn begin_snapshot_transfer(&mut self, peer_id: MemberId) {
        let snapshot = match self.snapshots.latest() {
            Some(snapshot) => snapshot.clone(),
            None => {
                // Compaction without a snapshot cannot happen; log and bail.
                slog::error!(self.logger, "Peer {} is behind compaction point but no snapshot exists", peer_id);
                return;
            }
        };
        slog::info!(
            self.logger,
            "Peer {} is behind the compaction point; starting snapshot transfer through {:?}",
            peer_id,
            snapshot.last_included_index,
        );
        let chunk_size = self.snapshots.chunk_size();
        if let Some(progress) = self.leader_peer_mut(&peer_id) {
            progress.snapshot_xfer = Some(SnapshotTransfer::new(
                snapshot.last_included_index,
                snapshot.last_included_term,
                snapshot.membership,
                snapshot.data,
                chunk_size,
            ));
        }
        self.send_snapshot_chunk(peer_id);
    }

    fn send_snapshot_chunk(&mut self, peer_id: MemberId) {
        let term = self.election_state.current_term;
        let my_id = self.my_id.clone();
        let network = self.peer_network.clone();
        let actor_client = self.actor_client.clone();
        let rpc_timeout = self.params.rpc_timeout;

        let progress = match self.leader_peer_mut(&peer_id) {
            Some(progress) => progress,
            None => return,
        };
        let request = match &progress.snapshot_xfer {
            Some(xfer) => {
                let (offset, chunk, done) = xfer.current_chunk();
                InstallSnapshot {
                    term,
                    leader_id: my_id,
                    last_included_index: xfer.last_included_index,
                    last_included_term: xfer.last_included_term,
                    offset,
                    chunk,
                    done,
                    membership: if done { xfer.membership.clone() } else { Vec::new() },
                }
            }
            None => return,
        };
        let seq_no = progress.next_seq_no();

        tokio::task::spawn(call_peer_install_snapshot(
            network,
            actor_client,
            peer_id,
            request,
            seq_no,
            rpc_timeout,
        ));
    }

    fn leader_peer_mut(&mut self, peer_id: &MemberId) -> Option<&mut PeerProgress> {
        match &mut self.role {
            Role::Leader(ls) => ls.peer_mut(peer_id),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn start_election(&mut self) -> Result<(), FatalError> {
        let new_term = self.election_state.current_term.next();
        self.update_election_state(ElectionState {
            current_term: new_term,
            voted_for: Some(self.my_id.clone()),
        })?;

        let old_role = self.role.as_raft_role();
        let timer = Self::new_election_timer(&self.policy, &self.params, &self.actor_client);
        self.role = Role::Candidate(CandidateState::new(self.my_id.clone(), timer));
        self.publish_role_change(old_role);
        self.publish_leader(None);

        if 1 >= self.cluster_tracker.majority() {
            return self.become_leader();
        }

        let request = RequestVote {
            term: new_term,
            candidate_id: self.my_id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer_id in self.cluster_tracker.peer_ids() {
            tokio::task::spawn(call_peer_request_vote(
                self.peer_network.clone(),
                self.actor_client.clone(),
                peer_id,
                request.clone(),
                self.params.rpc_timeout,
            ));
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<(), FatalError> {
        let term = self.election_state.current_term;
        let old_role = self.role.as_raft_role();

        let mut peers = HashMap::new();
        for peer_id in self.cluster_tracker.peer_ids() {
            let heartbeat = HeartbeatTimerHandle::spawn_timer_task(
                self.params.heartbeat_interval,
                self.actor_client.clone(),
                peer_id.clone(),
                term,
            );
            peers.insert(peer_id, PeerProgress::new(self.log.last_index(), heartbeat));
        }

        // An uncommitted backlog from prior terms cannot be committed by
        // counting replicas directly; only an entry from our own term can
        // carry it over the line. Append a no-op and hold client traffic
        // until it commits.
        let phase = if self.log.commit_index() < self.log.last_index() {
            let noop = self.log.append(term, Command::Noop);
            self.persistence.append_to_journal(&noop)?;
            LeaderPhase::Warmup {
                until_committed: noop.index,
            }
        } else {
            LeaderPhase::Steady
        };

        slog::info!(
            self.logger,
            "Won election for term {:?}; leading as {:?}",
            term,
            phase,
        );
        self.role = Role::Leader(LeaderVolatile::new(phase, peers));
        self.publish_role_change(old_role);
        self.publish_leader(Some(self.my_id.clone()));

        // A lone member needs no replication round.
        if self.cluster_tracker.num_members() == 1 {
            self.advance_commit_if_quorum()?;
        }
        Ok(())
    }

    fn become_follower(&mut self, term: Term, leader: Option<MemberId>) -> Result<(), FatalError> {
        if term > self.election_state.current_term {
            self.update_election_state(ElectionState {
                current_term: term,
                voted_for: None,
            })?;
        }

        // Anyone waiting on a commit acknowledgement from our leadership will
        // never get one from us; dropping the senders surfaces that.
        self.pending_applies.clear();

        let old_role = self.role.as_raft_role();
        let timer = Self::new_election_timer(&self.policy, &self.params, &self.actor_client);
        self.role = Role::Follower(FollowerState::new(leader.clone(), timer));
        self.publish_role_change(old_role);
        self.publish_leader(leader);
        Ok(())
    }

    /// Handle a message that proves a valid leader exists for `term`.
    fn acknowledge_leader(&mut self, term: Term, leader_id: MemberId) -> Result<(), FatalError> {
        let must_step_down = term > self.election_state.current_term || !matches!(self.role, Role::Follower(_));
        if must_step_down {
            self.become_follower(term, Some(leader_id))?;
        } else {
            let leader_changed = match &mut self.role {
                Role::Follower(fs) => {
                    fs.reset_timeout();
                    if fs.leader.as_ref() != Some(&leader_id) {
                        fs.leader = Some(leader_id.clone());
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if leader_changed {
                self.publish_leader(Some(leader_id));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit / apply / snapshot plumbing
    // ------------------------------------------------------------------

    /// Leader-side commit rule: find the highest index replicated on a
    /// majority, and only ratchet if that entry is from our own term.
    fn advance_commit_if_quorum(&mut self) -> Result<(), FatalError> {
        let ls = match &self.role {
            Role::Leader(ls) => ls,
            _ => return Ok(()),
        };

        let mut matched = ls.matched_indexes();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matched[self.cluster_tracker.majority() - 1];

        if quorum_index <= self.log.commit_index() {
            return Ok(());
        }
        // > Raft never commits log entries from previous terms by counting
        // > replicas.
        if self.log.term_at(quorum_index) != Some(self.election_state.current_term) {
            return Ok(());
        }

        self.log.ratchet_commit_index(quorum_index);
        self.apply_committed_entries();
        self.maybe_capture_snapshot()?;

        // Warmup completes once the backlog (through our no-op) is committed.
        let old_role = self.role.as_raft_role();
        if let Role::Leader(ls) = &mut self.role {
            if let LeaderPhase::Warmup { until_committed } = ls.phase {
                if self.log.commit_index() >= until_committed {
                    slog::info!(self.logger, "Prior-term backlog committed; accepting client traffic");
                    ls.phase = LeaderPhase::Steady;
                    self.publish_role_change(old_role);
                }
            }
        }
        Ok(())
    }

    fn apply_committed_entries(&mut self) {
        while let Some(entry) = self.log.take_next_to_apply() {
            let output = match &entry.command {
                Command::Noop => None,
                Command::Client(_) => Some(self.state_machine.apply(&entry)),
            };
            if let Some(pending) = self.pending_applies.remove(&entry.index.as_u64()) {
                // Same index, different term means the submitted entry was
                // truncated away and something else committed in its place.
                if pending.term == entry.term {
                    if let Some(output) = output {
                        let _ = pending.tx.send(output);
                    }
                }
            }
        }
    }

    fn maybe_capture_snapshot(&mut self) -> Result<(), FatalError> {
        if !self.snapshots.should_capture(&self.log) {
            return Ok(());
        }
        let last_included_index = self.log.last_applied();
        let last_included_term = match self.log.term_at(last_included_index) {
            Some(term) => term,
            None => return Ok(()),
        };
        let snapshot = Snapshot {
            last_included_index,
            last_included_term,
            data: self.state_machine.capture_snapshot(),
            membership: self.cluster_tracker.members(),
        };
        self.snapshots.capture(snapshot, &mut self.persistence, &mut self.log)?;
        Ok(())
    }

    fn update_election_state(&mut self, new_state: ElectionState) -> Result<(), FatalError> {
        self.persistence.persist_election_state(&new_state)?;
        self.election_state = new_state;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn publish_role_change(&self, old_role: crate::replica::RaftRole) {
        let new_role = self.role.as_raft_role();
        if new_role != old_role {
            self.notifier.notify_role_change(RaftRoleChanged {
                member_id: self.my_id.clone(),
                old_role: Some(old_role),
                new_role,
            });
        }
    }

    fn publish_leader(&mut self, leader: Option<MemberId>) {
        if self.published_leader == leader {
            return;
        }
        self.published_leader = leader.clone();
        let leader_payload_version = leader
            .as_ref()
            .and_then(|id| self.cluster_tracker.member(id))
            .map(|m| m.payload_version);
        self.notifier.notify_leader_change(LeaderStateChanged {
            member_id: self.my_id.clone(),
            leader_id: leader,
            leader_payload_version,
        });
    }

    // ------------------------------------------------------------------
    // Administrative
    // ------------------------------------------------------------------

    pub(crate) fn handle_transfer_leadership(&mut self) -> Result<(), TransferLeadershipError> {
        let ls = match &self.role {
            Role::Leader(ls) => ls,
            _ => return Err(TransferLeadershipError::NotLeader),
        };
        let target = match ls.best_peer() {
            Some(target) => target.clone(),
            None => return Err(TransferLeadershipError::NoPeers),
        };
        slog::info!(self.logger, "Transferring leadership to {}", target);

        let request = TimeoutNow {
            term: self.election_state.current_term,
            leader_id: self.my_id.clone(),
        };
        let network = self.peer_network.clone();
        let logger = self.logger.clone();
        let rpc_timeout = self.params.rpc_timeout;
        tokio::task::spawn(async move {
            let result = time::timeout(rpc_timeout, network.timeout_now(&target, request)).await;
            if !matches!(result, Ok(Ok(()))) {
                slog::warn!(logger, "TimeoutNow to {} failed", target);
            }
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn testing_snapshot_index(&self) -> Index {
        self.log.snapshot_index()
    }

    #[cfg(test)]
    pub(crate) fn testing_commit_index(&self) -> Index {
        self.log.commit_index()
    }

    #[cfg(test)]
    pub(crate) fn testing_role(&self) -> crate::replica::RaftRole {
        self.role.as_raft_role()
    }

    #[cfg(test)]
    pub(crate) fn testing_current_term(&self) -> Term {
        self.election_state.current_term
    }
}

async fn call_peer_request_vote(
    network: Arc<dyn PeerNetwork>,
    actor_client: WeakActorClient,
    peer_id: MemberId,
    request: RequestVote,
    rpc_timeout: time::Duration,
) {
    let term = request.term;
    let result = match time::timeout(rpc_timeout, network.request_vote(&peer_id, request)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    };
    let _ = actor_client
        .notify_request_vote_reply(RequestVoteReplyFromPeer { peer_id, term, result })
        .await;
}

async fn call_peer_append_entries(
    network: Arc<dyn PeerNetwork>,
    actor_client: WeakActorClient,
    peer_id: MemberId,
    request: AppendEntries,
    seq_no: u64,
    rpc_timeout: time::Duration,
) {
    let term = request.term;
    let result = match time::timeout(rpc_timeout, network.append_entries(&peer_id, request)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    };
    let _ = actor_client
        .notify_append_entries_reply(AppendEntriesReplyFromPeer {
            peer_id,
            term,
            seq_no,
            result,
        })
        .await;
}

async fn call_peer_install_snapshot(
    network: Arc<dyn PeerNetwork>,
    actor_client: WeakActorClient,
    peer_id: MemberId,
    request: InstallSnapshot,
    seq_no: u64,
    rpc_timeout: time::Duration,
) {
    let term = request.term;
    let result = match time::timeout(rpc_timeout, network.install_snapshot(&peer_id, request)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    };
    let _ = actor_client
        .notify_install_snapshot_reply(InstallSnapshotReplyFromPeer {
            peer_id,
            term,
            seq_no,
            result,
        })
        .await;
}
