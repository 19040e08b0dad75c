//! Runtime configuration consumed by the partition executor.

use std::time::Duration;

use crate::ids::PartitionCount;

/// Candidate-selection policy for the speculative scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    /// Return the first non-conflicting candidate.
    First,
    /// Among the window, pick the minimum estimated remaining time.
    Shortest,
    /// Among the window, pick the maximum estimated remaining time.
    Longest,
}

/// Per-process configuration for partition executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of partitions in the cluster.
    pub partition_count: PartitionCount,
    /// Partitions hosted per site; used to stripe partitions across sites.
    pub partitions_per_site: u16,
    /// Master switch for speculative execution.
    pub specexec_enable: bool,
    /// Candidate-selection policy for the speculative scheduler.
    pub scheduler_policy: SchedulerPolicy,
    /// Maximum lock-queue entries examined per speculative scan.
    pub scheduler_window: usize,
    /// Keep the cached scan cursor when the lock-queue size changes.
    pub ignore_queue_size_change: bool,
    /// Keep the cached scan cursor when the speculation type changes.
    pub ignore_speculation_type_change: bool,
    /// Skip speculation while the current dtxn only touches local-site partitions.
    pub ignore_all_local: bool,
    /// Always allocate a fresh undo token for write rounds.
    pub force_undo_logging: bool,
    /// Allow the estimator-driven fast path that disables undo logging for the
    /// non-abortable read-only remainder of a transaction.
    pub allow_undo_logging_disable: bool,
    /// Work-queue poll timeout for the executor loop.
    pub work_queue_poll: Duration,
    /// How long the fragment dispatcher waits for remote results before the
    /// cluster is presumed unhealthy.
    pub response_timeout: Duration,
    /// Minimum interval between engine ticks.
    pub tick_interval: Duration,
    /// Minimum interval between table-stats refreshes.
    pub stats_interval: Duration,
    /// Bounded size of the per-partition prefetch result cache.
    pub query_cache_entries: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            partition_count: PartitionCount::new(2).expect("literal partition count must be non-zero"),
            partitions_per_site: 2,
            specexec_enable: true,
            scheduler_policy: SchedulerPolicy::First,
            scheduler_window: 10,
            ignore_queue_size_change: false,
            ignore_speculation_type_change: false,
            ignore_all_local: false,
            force_undo_logging: false,
            allow_undo_logging_disable: false,
            work_queue_poll: Duration::from_micros(10),
            response_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(20),
            query_cache_entries: 256,
        }
    }
}
