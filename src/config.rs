//! Engine configuration.

use std::time::Duration;

/// Shard-level engine configuration. Per-domain overrides in the original
/// deployment flow through dynamic config; here the knobs are plain fields
/// with production-shaped defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum length of caller-chosen identifiers (domain names, workflow
    /// IDs, task lists, activity/timer IDs, workflow types).
    pub max_id_length_limit: usize,

    /// Payload size at which a warning is logged.
    pub blob_size_limit_warn: usize,

    /// Payload size at which the decision is converted into a
    /// fail-workflow event.
    pub blob_size_limit_error: usize,

    /// Cap on signal events per execution; 0 disables the cap.
    pub maximum_signals_per_execution: usize,

    /// Cap on buffered events held while a decision is in flight.
    pub maximum_buffered_events: usize,

    /// Bounded list of auto-reset points; the oldest rotates out at the cap.
    pub max_auto_reset_points: usize,

    /// How long a `get_mutable_state` long poll may wait for new events.
    pub long_poll_expiration_interval: Duration,

    /// Attempt budget of the optimistic-concurrency update loop.
    pub conditional_retry_count: usize,

    /// Capacity of the execution cache (in-use entries are never evicted).
    pub execution_cache_size: usize,

    /// Default deadline applied when a caller does not supply one.
    pub default_operation_timeout: Duration,

    /// System workflow parallelism for the archival hand-off.
    pub num_archive_system_workflows: usize,

    /// Rate limit for archival requests, per second.
    pub archive_request_rps: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_id_length_limit: 1000,
            blob_size_limit_warn: 256 * 1024,
            blob_size_limit_error: 2 * 1024 * 1024,
            maximum_signals_per_execution: 10_000,
            maximum_buffered_events: 1024,
            max_auto_reset_points: 20,
            long_poll_expiration_interval: Duration::from_secs(20),
            conditional_retry_count: 5,
            execution_cache_size: 256,
            default_operation_timeout: Duration::from_secs(10),
            num_archive_system_workflows: 1000,
            archive_request_rps: 300,
        }
    }
}
