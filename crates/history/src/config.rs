use std::time::Duration;

/// Tunables of the per-shard history core.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Optimistic-concurrency retries per timer task before giving up.
    pub conditional_retry_count: usize,
    pub timer_batch_size: usize,
    pub timer_max_poll_rps: u32,
    pub timer_update_ack_interval: Duration,
    pub timer_worker_pool_size: usize,
    /// Upper bound on buffered out-of-order replication events per run.
    pub buffered_events_limit: usize,
    /// Subtracted from the last applied event's timestamp when advancing a
    /// remote cluster's time watermark.
    pub standby_cluster_delay: Duration,
    /// Ceiling on the continue-as-new chain walk during conflict
    /// resolution; looping chains fail loudly instead of spinning.
    pub continue_as_new_walk_limit: usize,
    /// Retention before a closed run's history is deleted.
    pub history_retention: Duration,
    pub history_page_size: usize,
    pub matching_retry_max_attempts: usize,
    pub matching_retry_initial_backoff: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            conditional_retry_count: 5,
            timer_batch_size: 100,
            timer_max_poll_rps: 100,
            timer_update_ack_interval: Duration::from_secs(5),
            timer_worker_pool_size: 10,
            buffered_events_limit: 256,
            standby_cluster_delay: Duration::from_secs(5 * 60),
            continue_as_new_walk_limit: 32,
            history_retention: Duration::from_secs(24 * 60 * 60),
            history_page_size: 100,
            matching_retry_max_attempts: 4,
            matching_retry_initial_backoff: Duration::from_millis(50),
        }
    }
}
