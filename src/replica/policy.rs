/// Deployment-topology strategy knobs that alter the engine's consensus
/// defaults. Implementations must be cheap and side-effect free; the engine
/// consults them on the hot path.
pub trait RaftPolicy: Send + Sync + 'static {
    /// When false, this replica never arms an election timer: leadership is
    /// pinned externally (deterministic tests, asymmetric two-node rigs).
    /// A `TimeoutNow` message still forces an election.
    fn automatic_elections_enabled(&self) -> bool {
        true
    }

    /// When true, a leader applies client commands to the state machine
    /// immediately after the local append, before majority acknowledgement.
    /// Trades the default consistency guarantee for availability; only
    /// meaningful in explicitly degraded two-node topologies.
    fn apply_modification_to_state_before_consensus(&self) -> bool {
        false
    }
}

/// Standard raft safety: elections on, no pre-consensus apply.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRaftPolicy;

impl RaftPolicy for DefaultRaftPolicy {}
