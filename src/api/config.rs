use std::convert::TryFrom;
use tokio::time::Duration;

/// Engine tuning knobs. Every field is optional; unset fields take the
/// defaults below, and the whole set is validated together when the engine
/// starts.
#[derive(Clone, Default)]
pub struct RaftOptions {
    pub heartbeat_interval: Option<Duration>,
    pub election_timeout_min: Option<Duration>,
    pub election_timeout_max: Option<Duration>,
    pub rpc_timeout: Option<Duration>,
    /// How long a leader tolerates silence from a member before counting it
    /// out of contact for isolation detection.
    pub leader_isolation_window: Option<Duration>,
    pub snapshot_threshold_entries: Option<usize>,
    pub snapshot_threshold_bytes: Option<u64>,
    /// Entries kept below the compaction point so followers lagging slightly
    /// behind a fresh snapshot are still served plain AppendEntries.
    pub snapshot_retain_entries: Option<usize>,
    pub snapshot_chunk_size: Option<usize>,
    pub append_batch_size: Option<usize>,
    pub inbox_buffer_size: Option<usize>,
}

/// Validated, fully defaulted configuration the engine actually runs with.
#[derive(Clone)]
pub struct ConfigParams {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub rpc_timeout: Duration,
    pub leader_isolation_window: Duration,
    pub snapshot_threshold_entries: usize,
    pub snapshot_threshold_bytes: u64,
    pub snapshot_retain_entries: usize,
    pub snapshot_chunk_size: usize,
    pub append_batch_size: usize,
    pub inbox_buffer_size: usize,
}

impl ConfigParams {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval must be non-zero");
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("Minimum election timeout must be greater than the heartbeat interval");
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("Minimum election timeout must be less than the maximum election timeout");
        }
        if self.rpc_timeout >= self.election_timeout_min {
            return Err("RPC timeout must be less than the minimum election timeout");
        }
        if self.leader_isolation_window <= self.heartbeat_interval {
            return Err("Leader isolation window must exceed the heartbeat interval");
        }
        if self.snapshot_threshold_entries == 0 {
            return Err("Snapshot entry threshold must be non-zero");
        }
        if self.snapshot_retain_entries >= self.snapshot_threshold_entries {
            return Err("Snapshot retain window must be smaller than the entry threshold");
        }
        if self.snapshot_chunk_size == 0 {
            return Err("Snapshot chunk size must be non-zero");
        }
        if self.append_batch_size == 0 {
            return Err("AppendEntries batch size must be non-zero");
        }
        if self.inbox_buffer_size == 0 {
            return Err("Inbox buffer size must be non-zero");
        }
        Ok(())
    }
}

impl Default for ConfigParams {
    fn default() -> Self {
        ConfigParams {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1500),
            rpc_timeout: Duration::from_millis(300),
            leader_isolation_window: Duration::from_secs(2),
            snapshot_threshold_entries: 4096,
            snapshot_threshold_bytes: 8 * 1024 * 1024,
            snapshot_retain_entries: 256,
            snapshot_chunk_size: 256 * 1024,
            append_batch_size: 128,
            inbox_buffer_size: 1024,
        }
    }
}

impl TryFrom<RaftOptions> for ConfigParams {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let defaults = ConfigParams::default();
        let values = ConfigParams {
            heartbeat_interval: options.heartbeat_interval.unwrap_or(defaults.heartbeat_interval),
            election_timeout_min: options.election_timeout_min.unwrap_or(defaults.election_timeout_min),
            election_timeout_max: options.election_timeout_max.unwrap_or(defaults.election_timeout_max),
            rpc_timeout: options.rpc_timeout.unwrap_or(defaults.rpc_timeout),
            leader_isolation_window: options
                .leader_isolation_window
                .unwrap_or(defaults.leader_isolation_window),
            snapshot_threshold_entries: options
                .snapshot_threshold_entries
                .unwrap_or(defaults.snapshot_threshold_entries),
            snapshot_threshold_bytes: options
                .snapshot_threshold_bytes
                .unwrap_or(defaults.snapshot_threshold_bytes),
            snapshot_retain_entries: options
                .snapshot_retain_entries
                .unwrap_or(defaults.snapshot_retain_entries),
            snapshot_chunk_size: options.snapshot_chunk_size.unwrap_or(defaults.snapshot_chunk_size),
            append_batch_size: options.append_batch_size.unwrap_or(defaults.append_batch_size),
            inbox_buffer_size: options.inbox_buffer_size.unwrap_or(defaults.inbox_buffer_size),
        };

        values.validate()?;
        Ok(values)
    }
}
