//! Timer queue processors: the active drain of this cluster's timers, and
//! failover drains that take over a standby cluster's timers for one
//! domain after it fails over here.
//!
//! Lifecycle is Stopped -> Running -> Stopping -> Stopped. The single poll
//! loop waits on the timer gate, reads due tasks through the ack manager
//! and hands each to a semaphore-bounded worker under the shard's dispatch
//! budget. Any observed `ShardOwnershipLost` stops the processor to keep
//! duplicate fires during a shard hand-off to a minimum.

use crate::ack_manager::TimerAckManager;
use crate::cache::ExecutionCache;
use crate::config::HistoryConfig;
use crate::matching::RetryingMatchingClient;
use crate::rate_limit::RpsLimiter;
use crate::shard::ShardContext;
use crate::timer_gate::{GateSignal, TimerGate};
use crate::ProcessError;
use chrono::{DateTime, Utc};
use concepts::cluster::ClusterName;
use concepts::storage::{MatchingClient, StoreError};
use concepts::tasks::{TimerTask, TimerTaskKind};
use concepts::time::{ClockFn, Sleep};
use concepts::{DomainId, FailoverVersion};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

const STATUS_STOPPED: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPING: u8 = 2;

/// What a processor instance is responsible for.
#[derive(Debug, Clone)]
pub enum ProcessorKind {
    /// All timers of domains active in this cluster.
    Active,
    /// Timers of one domain previously owned by a standby cluster, drained
    /// up to the failover ceiling.
    Failover {
        domain_id: DomainId,
        from_cluster: ClusterName,
    },
}

pub struct TimerQueueProcessor<C: ClockFn, S: Sleep> {
    pub(crate) shard: Arc<ShardContext<C>>,
    pub(crate) cache: Arc<ExecutionCache<C>>,
    pub(crate) ack: TimerAckManager<C>,
    pub(crate) gate: TimerGate,
    pub(crate) kind: ProcessorKind,
    pub(crate) matching: Arc<dyn MatchingClient>,
    pub(crate) sleep: S,
    status: AtomicU8,
    worker_permits: Arc<Semaphore>,
    rps: RpsLimiter,
}

impl<C: ClockFn, S: Sleep> TimerQueueProcessor<C, S> {
    #[must_use]
    pub fn new_active(
        shard: Arc<ShardContext<C>>,
        cache: Arc<ExecutionCache<C>>,
        matching: Arc<dyn MatchingClient>,
        sleep: S,
    ) -> Arc<Self> {
        let ack = TimerAckManager::new_active(shard.clone());
        Self::build(shard, cache, ack, ProcessorKind::Active, matching, sleep)
    }

    /// Failover processor for `domain_id`, draining timers owned by
    /// `from_cluster` in `[min_level, max_level)`.
    #[must_use]
    pub fn new_failover(
        shard: Arc<ShardContext<C>>,
        cache: Arc<ExecutionCache<C>>,
        matching: Arc<dyn MatchingClient>,
        sleep: S,
        domain_id: DomainId,
        from_cluster: ClusterName,
        min_level: DateTime<Utc>,
        max_level: DateTime<Utc>,
    ) -> Arc<Self> {
        let ack = TimerAckManager::new_failover(
            shard.clone(),
            domain_id,
            from_cluster.clone(),
            min_level,
            max_level,
        );
        Self::build(
            shard,
            cache,
            ack,
            ProcessorKind::Failover {
                domain_id,
                from_cluster,
            },
            matching,
            sleep,
        )
    }

    fn build(
        shard: Arc<ShardContext<C>>,
        cache: Arc<ExecutionCache<C>>,
        ack: TimerAckManager<C>,
        kind: ProcessorKind,
        matching: Arc<dyn MatchingClient>,
        sleep: S,
    ) -> Arc<Self> {
        let config = shard.config();
        let matching: Arc<dyn MatchingClient> = Arc::new(RetryingMatchingClient::new(
            matching,
            sleep.clone(),
            config.matching_retry_max_attempts,
            config.matching_retry_initial_backoff,
        ));
        let worker_permits = Arc::new(Semaphore::new(config.timer_worker_pool_size));
        let rps = RpsLimiter::new(config.timer_max_poll_rps);
        Arc::new(Self {
            shard,
            cache,
            ack,
            gate: TimerGate::new(),
            kind,
            matching,
            sleep,
            status: AtomicU8::new(STATUS_STOPPED),
            worker_permits,
            rps,
        })
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        self.shard.config()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    /// Spawns the poll loop and the ack flusher.
    pub fn start(self: &Arc<Self>) -> TimerProcessorHandle<C, S> {
        self.status
            .compare_exchange(
                STATUS_STOPPED,
                STATUS_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .expect("processor already started");
        info!(kind = ?self.kind, "Starting timer queue processor");
        // Kick the first read immediately.
        self.gate.update(self.shard.now());

        let poll = {
            let processor = self.clone();
            let span = info_span!("timer_poll_loop");
            tokio::spawn(async move { processor.run_loop().await }.instrument(span)).abort_handle()
        };
        let ack = {
            let processor = self.clone();
            let span = info_span!("timer_ack_loop");
            tokio::spawn(async move { processor.ack_loop().await }.instrument(span)).abort_handle()
        };
        TimerProcessorHandle {
            processor: self.clone(),
            poll_abort: poll,
            ack_abort: ack,
        }
    }

    /// Transition to Stopping: close the gate so the poll loop exits and
    /// refuse further reads. Workers drain through the handle.
    pub fn stop(&self) {
        if self
            .status
            .compare_exchange(
                STATUS_RUNNING,
                STATUS_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(kind = ?self.kind, "Stopping timer queue processor");
            self.gate.close();
        }
    }

    fn set_stopped(&self) {
        self.status.store(STATUS_STOPPED, Ordering::Release);
    }

    /// New timer tasks were persisted by some other component (the
    /// replicator, the transfer path): re-arm the gate at the earliest of
    /// them and wake the poll loop.
    pub fn notify_new_timers(&self, tasks: &[TimerTask]) {
        let Some(earliest) = tasks.iter().map(|task| task.visibility_timestamp).min() else {
            return;
        };
        self.gate.update(earliest);
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.gate.wait(self.shard.clock(), &self.sleep).await {
                GateSignal::Closed => break,
                GateSignal::Fired => {}
            }
            if !self.is_running() {
                break;
            }
            if let Err(err) = self.drain_due_timers().await {
                warn!(%err, "Timer poll iteration failed");
                if matches!(err, ProcessError::Store(StoreError::ShardOwnershipLost)) {
                    self.stop();
                    break;
                }
                // Transient store failure: retry after a short pause.
                self.sleep.sleep(Duration::from_secs(1)).await;
                self.gate.update(self.shard.now());
            }
        }
        debug!("Timer poll loop exited");
    }

    /// One gate firing: read batches until the queue is momentarily empty,
    /// dispatching every due task to the worker pool.
    async fn drain_due_timers(self: &Arc<Self>) -> Result<(), ProcessError> {
        loop {
            let batch = self.ack.read_timer_tasks().await?;
            for task in batch.tasks {
                self.rps.acquire(&self.sleep).await;
                let permit = self
                    .worker_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ProcessError::Internal("worker pool closed".to_string()))?;
                let processor = self.clone();
                let kind_label: &'static str = (&task.kind).into();
                let span = info_span!("timer_task", task_id = %task.task_id, kind = kind_label);
                tokio::spawn(
                    async move {
                        if let Err(err) = processor.process(&task).await {
                            warn!(%err, "Timer task left unacked for retry");
                        }
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            if let Some(look_ahead) = batch.look_ahead {
                self.gate.update(look_ahead.visibility_timestamp);
            }
            if !batch.more_available || !self.is_running() {
                return Ok(());
            }
        }
    }

    async fn ack_loop(self: Arc<Self>) {
        loop {
            self.sleep
                .sleep(self.shard.config().timer_update_ack_interval)
                .await;
            if !self.is_running() {
                break;
            }
            match self.ack.update_ack_level().await {
                Ok(progress) if progress.finished => {
                    info!("Failover timer drain finished");
                    self.stop();
                    break;
                }
                Ok(_) => {}
                Err(StoreError::ShardOwnershipLost) => {
                    warn!("Shard ownership lost while persisting ack level");
                    self.stop();
                    break;
                }
                Err(err) => warn!(%err, "Failed to update timer ack level"),
            }
        }
        debug!("Timer ack loop exited");
    }

    /// Processes one timer task: ownership filter, per-kind handler, then
    /// the ack/err policy. An execution deleted between schedule and fire
    /// acks silently; other failures leave the task for a later read.
    #[instrument(skip_all, fields(task_id = %task.task_id))]
    pub async fn process(self: &Arc<Self>, task: &TimerTask) -> Result<(), ProcessError> {
        if !self.accept(task)? {
            debug!("Discarding timer task not owned by this processor");
            self.ack.complete_timer_task(task.key()).await?;
            return Ok(());
        }
        let result = match &task.kind {
            TimerTaskKind::UserTimer { .. } => self.process_user_timer(task).await,
            TimerTaskKind::ActivityTimeout { .. } => self.process_activity_timeout(task).await,
            TimerTaskKind::DecisionTimeout { .. } => self.process_decision_timeout(task).await,
            TimerTaskKind::WorkflowTimeout => self.process_workflow_timeout(task).await,
            TimerTaskKind::ActivityRetry { .. } => self.process_activity_retry(task).await,
            TimerTaskKind::DeleteHistory => self.process_delete_history(task).await,
        };
        match result {
            Ok(()) => {
                self.ack.complete_timer_task(task.key()).await?;
                Ok(())
            }
            Err(ProcessError::Store(StoreError::NotFound)) => {
                // Fired after the execution was deleted.
                self.ack.complete_timer_task(task.key()).await?;
                Ok(())
            }
            Err(err) => {
                if matches!(err, ProcessError::Store(StoreError::ShardOwnershipLost)) {
                    self.stop();
                }
                Err(err)
            }
        }
    }

    /// Ownership filter: the active processor owns tasks of domains active
    /// in this cluster; a failover processor owns exactly its domain.
    fn accept(&self, task: &TimerTask) -> Result<bool, ProcessError> {
        match &self.kind {
            ProcessorKind::Active => {
                let entry = self
                    .shard
                    .domains()
                    .entry_by_id(&task.domain_id)
                    .ok_or_else(|| {
                        ProcessError::Internal(format!("unknown domain {}", task.domain_id))
                    })?;
                Ok(entry.is_active_in(self.shard.cluster_metadata().current_cluster()))
            }
            ProcessorKind::Failover { domain_id, .. } => Ok(task.domain_id == *domain_id),
        }
    }

    /// For global domains a version mismatch means a concurrent failover
    /// superseded this task; it is acked without work.
    pub(crate) fn verify_task_version(
        &self,
        domain_id: &DomainId,
        state_version: FailoverVersion,
        task_version: FailoverVersion,
    ) -> Result<bool, ProcessError> {
        let entry = self
            .shard
            .domains()
            .entry_by_id(domain_id)
            .ok_or_else(|| ProcessError::Internal(format!("unknown domain {domain_id}")))?;
        if !entry.is_global {
            return Ok(true);
        }
        if state_version != task_version {
            debug!(%state_version, %task_version, "Dropping task superseded by failover");
            return Ok(false);
        }
        Ok(true)
    }
}

pub struct TimerProcessorHandle<C: ClockFn, S: Sleep> {
    processor: Arc<TimerQueueProcessor<C, S>>,
    poll_abort: AbortHandle,
    ack_abort: AbortHandle,
}

impl<C: ClockFn, S: Sleep> TimerProcessorHandle<C, S> {
    #[must_use]
    pub fn processor(&self) -> &Arc<TimerQueueProcessor<C, S>> {
        &self.processor
    }

    /// Stop and drain: closes the gate, waits for the poll loop to exit
    /// and for every worker to finish.
    pub async fn stop(&self) {
        self.processor.stop();
        while !self.poll_abort.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.ack_abort.abort();
        let pool_size = self.processor.shard.config().timer_worker_pool_size;
        let _drained = self
            .processor
            .worker_permits
            .acquire_many(pool_size as u32)
            .await;
        self.processor.set_stopped();
        info!("Timer queue processor stopped");
    }
}

impl<C: ClockFn, S: Sleep> Drop for TimerProcessorHandle<C, S> {
    fn drop(&mut self) {
        self.poll_abort.abort();
        self.ack_abort.abort();
    }
}
