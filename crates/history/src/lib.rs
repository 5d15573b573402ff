//! Per-shard core of the meridian history service: the workflow-execution
//! cache, mutable-state projection, timer queue processors (active and
//! failover) and the standby history replicator.
//!
//! Everything here operates on one shard; shards are independent. All
//! persistence is fenced by the shard range token, and all mutation of a
//! single run serializes on that run's execution lock.

use concepts::storage::{MatchingError, StoreError};

pub mod ack_manager;
pub mod cache;
pub mod config;
pub mod conflict_resolver;
pub mod matching;
pub mod mutable_state;
pub mod rate_limit;
pub mod replicator;
pub mod shard;
pub mod state_builder;
pub mod timer_gate;
mod timer_handlers;
pub mod timer_processor;

/// Failure taxonomy of the timer-processing path.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Matching(#[from] MatchingError),
    /// The optimistic-concurrency retry budget ran out; the task stays
    /// unacked and is retried on a later cycle.
    #[error("max attempts exceeded")]
    MaxAttemptsExceeded,
    #[error("internal: {0}")]
    Internal(String),
}
