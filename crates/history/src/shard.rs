//! Process-local state of one shard.
//!
//! The shard record's `range_id` is the fencing token: it is attached to
//! every persistence call, and a mismatch anywhere means another process
//! took the lease, so all pending work must halt. Task and transaction ids
//! are allocated from the range (`range_id << RANGE_SHIFT | counter`),
//! which keeps them monotonic across ownership changes.

use crate::config::HistoryConfig;
use chrono::{DateTime, Utc};
use concepts::cluster::{ClusterMetadata, ClusterName, DomainRegistry};
use concepts::storage::{ExecutionStore, HistoryStore, ShardRecord, ShardStore, StoreError};
use concepts::tasks::{TimerKey, TimerTask, TransferTask};
use concepts::time::ClockFn;
use concepts::{DomainId, TaskId};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

const RANGE_SHIFT: u32 = 24;

pub struct ShardContext<C: ClockFn> {
    config: Arc<HistoryConfig>,
    clock: C,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    shard_store: Arc<dyn ShardStore>,
    cluster: Arc<ClusterMetadata>,
    domains: Arc<dyn DomainRegistry>,
    state: Mutex<ShardState>,
}

struct ShardState {
    record: ShardRecord,
    next_task_seq: i64,
}

impl<C: ClockFn> ShardContext<C> {
    /// Loads the shard record and builds the context. Lease negotiation is
    /// external; the caller hands us stores already scoped to this shard.
    pub async fn acquire(
        config: Arc<HistoryConfig>,
        clock: C,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        shard_store: Arc<dyn ShardStore>,
        cluster: Arc<ClusterMetadata>,
        domains: Arc<dyn DomainRegistry>,
    ) -> Result<Arc<Self>, StoreError> {
        let record = shard_store.get_shard().await?;
        debug!(shard_id = record.shard_id, range_id = record.range_id, "Acquired shard");
        Ok(Arc::new(Self {
            config,
            clock,
            execution_store,
            history_store,
            shard_store,
            cluster,
            domains,
            state: Mutex::new(ShardState {
                record,
                next_task_seq: 0,
            }),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[must_use]
    pub fn execution_store(&self) -> &Arc<dyn ExecutionStore> {
        &self.execution_store
    }

    #[must_use]
    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history_store
    }

    #[must_use]
    pub fn cluster_metadata(&self) -> &ClusterMetadata {
        &self.cluster
    }

    #[must_use]
    pub fn domains(&self) -> &Arc<dyn DomainRegistry> {
        &self.domains
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Authoritative current time of `cluster` as seen by this shard. The
    /// local cluster reads the wall clock; remote clusters read the
    /// watermark advanced by their replication stream.
    #[must_use]
    pub fn current_time(&self, cluster: &ClusterName) -> DateTime<Utc> {
        if cluster == self.cluster.current_cluster() {
            return self.clock.now();
        }
        self.state
            .lock()
            .unwrap()
            .record
            .cluster_times
            .get(cluster)
            .copied()
            .unwrap_or_else(|| self.clock.now())
    }

    /// Monotone advance of a remote cluster's time watermark.
    pub fn set_current_time(&self, cluster: &ClusterName, time: DateTime<Utc>) {
        if cluster == self.cluster.current_cluster() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let entry = state
            .record
            .cluster_times
            .entry(cluster.clone())
            .or_insert(time);
        if *entry < time {
            *entry = time;
        }
    }

    #[must_use]
    pub fn range_id(&self) -> i64 {
        self.state.lock().unwrap().record.range_id
    }

    #[must_use]
    pub fn next_task_id(&self) -> TaskId {
        let mut state = self.state.lock().unwrap();
        state.next_task_seq += 1;
        TaskId((state.record.range_id << RANGE_SHIFT) | state.next_task_seq)
    }

    /// Transaction ids share the task allocator; both only need per-shard
    /// monotonicity.
    #[must_use]
    pub fn next_transaction_id(&self) -> i64 {
        self.next_task_id().0
    }

    /// Stamps freshly built task records with shard-allocated ids.
    pub fn allocate_task_ids(&self, timer_tasks: &mut [TimerTask], transfer_tasks: &mut [TransferTask]) {
        for task in timer_tasks.iter_mut() {
            if task.task_id == TaskId(0) {
                task.task_id = self.next_task_id();
            }
        }
        for task in transfer_tasks.iter_mut() {
            if task.task_id == TaskId(0) {
                task.task_id = self.next_task_id();
            }
        }
    }

    #[must_use]
    pub fn timer_ack_level(&self) -> TimerKey {
        self.state.lock().unwrap().record.timer_ack_level
    }

    #[must_use]
    pub fn failover_ack_level(&self, domain_id: &DomainId, cluster: &ClusterName) -> Option<TimerKey> {
        self.state
            .lock()
            .unwrap()
            .record
            .failover_ack_levels
            .get(&(*domain_id, cluster.clone()))
            .copied()
    }

    /// Persists the timer ack level; a CAS failure here means the shard
    /// lease moved and the caller must shut down.
    #[instrument(skip_all, fields(visibility = %level.visibility_timestamp))]
    pub async fn update_timer_ack_level(&self, level: TimerKey) -> Result<(), StoreError> {
        let (record, expected_range_id) = {
            let mut state = self.state.lock().unwrap();
            state.record.timer_ack_level = level;
            (state.record.clone(), state.record.range_id)
        };
        self.shard_store.update_shard(record, expected_range_id).await
    }

    #[instrument(skip_all, fields(%domain_id, %cluster))]
    pub async fn update_failover_ack_level(
        &self,
        domain_id: &DomainId,
        cluster: &ClusterName,
        level: TimerKey,
    ) -> Result<(), StoreError> {
        let (record, expected_range_id) = {
            let mut state = self.state.lock().unwrap();
            state
                .record
                .failover_ack_levels
                .insert((*domain_id, cluster.clone()), level);
            (state.record.clone(), state.record.range_id)
        };
        self.shard_store.update_shard(record, expected_range_id).await
    }
}
