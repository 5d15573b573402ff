//! Standby apply path: receives history event batches from a remote active
//! cluster and folds them into local state, resolving version conflicts
//! and buffering out-of-order batches.
//!
//! Error contract (spec'd at the replication boundary):
//! - `Retry*` sentinels ask the upstream replication queue to requeue the
//!   task after a delay;
//! - `MissingReplicationInfo` / `CorruptedReplicationInfo` are permanent
//!   and must dead-letter;
//! - everything else is an ordinary store failure.

use crate::cache::{replicate_continue_as_new, ExecutionCache, ExecutionGuard};
use crate::conflict_resolver;
use crate::shard::ShardContext;
use crate::state_builder::{close_execution_tasks, StateBuilder};
use concepts::cluster::ClusterName;
use concepts::events::{decode_event_batch, EventAttributes, HistoryEvent};
use concepts::execution::{BufferedReplicationBatch, CloseStatus, ReplicationInfo, WorkflowState};
use concepts::storage::{ReadHistoryRequest, StoreError};
use concepts::tasks::{TimerTask, TransferTask};
use concepts::time::ClockFn;
use concepts::{
    DomainId, EventId, FailoverVersion, RequestId, RunId, WorkflowExecution, WorkflowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const CONFLICT_TERMINATE_REASON: &str = "terminated due to version conflict";

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The target execution does not exist yet; requeue after a delay.
    #[error("workflow execution not found yet")]
    RetryEntityNotExists,
    /// Another run of the same workflow at the same version is still
    /// running; requeue after a delay.
    #[error("workflow with same version is running")]
    RetryExistingWorkflow,
    /// Events arrived ahead of the local cursor; requeue or resend with
    /// force-buffering.
    #[error("events out of order, retry or force buffer")]
    RetryBufferEvents,
    /// Permanent: the request lacks replication info for the previous
    /// active cluster.
    #[error("missing replication info for previous active cluster")]
    MissingReplicationInfo,
    /// Permanent: replication info claims events the local history never
    /// had.
    #[error("corrupted replication info")]
    CorruptedReplicationInfo,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReplicationError {
    /// Upstream must requeue these after a small delay.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::RetryEntityNotExists
                | ReplicationError::RetryExistingWorkflow
                | ReplicationError::RetryBufferEvents
        )
    }

    /// Upstream must dead-letter these, never retry.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            ReplicationError::MissingReplicationInfo | ReplicationError::CorruptedReplicationInfo
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateEventsRequest {
    pub source_cluster: ClusterName,
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub first_event_id: EventId,
    pub next_event_id: EventId,
    pub version: FailoverVersion,
    pub history: Vec<HistoryEvent>,
    pub new_run_history: Option<Vec<HistoryEvent>>,
    pub replication_info: HashMap<ClusterName, ReplicationInfo>,
    /// When unset, an out-of-order batch is bounced back with
    /// [`ReplicationError::RetryBufferEvents`] instead of being buffered.
    pub force_buffer_events: bool,
}

/// Hook for waking the task processors about standby tasks a successful
/// apply produced.
pub trait TaskNotifier: Send + Sync {
    fn notify_timer_tasks(&self, cluster: &ClusterName, tasks: &[TimerTask]);
    fn notify_transfer_tasks(&self, cluster: &ClusterName, tasks: &[TransferTask]);
}

pub struct NoopNotifier;

impl TaskNotifier for NoopNotifier {
    fn notify_timer_tasks(&self, _cluster: &ClusterName, _tasks: &[TimerTask]) {}
    fn notify_transfer_tasks(&self, _cluster: &ClusterName, _tasks: &[TransferTask]) {}
}

struct BatchView<'a> {
    source_cluster: ClusterName,
    version: FailoverVersion,
    history: &'a [HistoryEvent],
    new_run_history: Option<&'a [HistoryEvent]>,
}

pub struct HistoryReplicator<C: ClockFn> {
    shard: Arc<ShardContext<C>>,
    cache: Arc<ExecutionCache<C>>,
    notifier: Arc<dyn TaskNotifier>,
}

impl<C: ClockFn> HistoryReplicator<C> {
    #[must_use]
    pub fn new(
        shard: Arc<ShardContext<C>>,
        cache: Arc<ExecutionCache<C>>,
        notifier: Arc<dyn TaskNotifier>,
    ) -> Self {
        Self {
            shard,
            cache,
            notifier,
        }
    }

    #[instrument(skip_all, fields(
        execution = %request.execution,
        source = %request.source_cluster,
        first = %request.first_event_id,
        next = %request.next_event_id,
        version = %request.version,
    ))]
    pub async fn apply_events(&self, request: ReplicateEventsRequest) -> Result<(), ReplicationError> {
        if request.history.is_empty() {
            warn!("Dropping empty replication task");
            return Ok(());
        }
        let result = self.apply_events_inner(&request).await;
        // Present existence races to the upstream queue as its retry
        // sentinels.
        match result {
            Err(ReplicationError::Store(StoreError::NotFound)) => {
                debug!("Mapping NotFound to retryable sentinel");
                Err(ReplicationError::RetryEntityNotExists)
            }
            Err(ReplicationError::Store(StoreError::AlreadyStarted { .. })) => {
                debug!("Mapping AlreadyStarted to retryable sentinel");
                Err(ReplicationError::RetryExistingWorkflow)
            }
            other => other,
        }
    }

    async fn apply_events_inner(
        &self,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        let first = &request.history[0];
        let is_start = matches!(
            first.attributes,
            EventAttributes::WorkflowExecutionStarted(_)
        );

        let mut guard = self
            .cache
            .get_or_create(
                request.domain_id,
                &request.execution.workflow_id,
                Some(request.execution.run_id),
            )
            .await
            .map_err(ReplicationError::Store)?;
        let load_status: Result<(), StoreError> = guard.load().await.map(|_| ());

        match (is_start, load_status) {
            (true, Ok(())) => {
                // Duplicate start event for an existing run.
                debug!("Dropping duplicate start replication task");
                Ok(())
            }
            (true, Err(StoreError::NotFound)) => {
                let result = self.apply_start_event(&mut guard, request).await;
                guard.finish(&result);
                result
            }
            (false, Ok(())) => {
                let result = self.apply_other_events_locked(&mut guard, request).await;
                guard.finish(&result);
                result
            }
            (false, Err(StoreError::NotFound)) => {
                drop(guard);
                self.apply_other_events_missing_mutable_state(request, first.version)
                    .await
            }
            (_, Err(err)) => Err(err.into()),
        }
    }

    /// Builds a brand-new run from its first replicated batch.
    async fn apply_start_event(
        &self,
        guard: &mut ExecutionGuard<C>,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        let state = crate::mutable_state::MutableState::new_for_replication(
            request.domain_id,
            request.execution.clone(),
            request.version,
        );
        guard.install(state);
        self.apply_replication_task(
            guard,
            &BatchView {
                source_cluster: request.source_cluster.clone(),
                version: request.version,
                history: &request.history,
                new_run_history: request.new_run_history.as_deref(),
            },
        )
        .await
    }

    /// The run this batch targets does not exist locally: drop if the
    /// current run already advanced past the incoming version, else try to
    /// unblock the current run's buffer and ask for a retry.
    async fn apply_other_events_missing_mutable_state(
        &self,
        request: &ReplicateEventsRequest,
        incoming_version: FailoverVersion,
    ) -> Result<(), ReplicationError> {
        let (current_run_id, current_last_write_version) = {
            let mut current = self
                .cache
                .get_or_create(request.domain_id, &request.execution.workflow_id, None)
                .await
                .map_err(ReplicationError::Store)?;
            let loaded = current
                .load()
                .await
                .map(|state| (state.run_id(), state.last_write_version()));
            current.finish(&loaded);
            loaded.map_err(ReplicationError::Store)?
        };

        if current_last_write_version > incoming_version {
            info!(%current_run_id, "Dropping stale replication task for missing run");
            return Ok(());
        }
        debug!(
            %current_run_id,
            %current_last_write_version,
            %incoming_version,
            "Target run missing; flushing current workflow buffer before retry"
        );
        self.flush_current_workflow_buffer(request.domain_id, &request.execution.workflow_id)
            .await?;
        Err(ReplicationError::RetryEntityNotExists)
    }

    async fn apply_other_events_locked(
        &self,
        guard: &mut ExecutionGuard<C>,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        // Pre-flush: buffered batches may unblock this one.
        self.flush_buffer(guard).await?;
        if !self.apply_other_events_version_checking(guard, request).await? {
            return Ok(());
        }
        self.apply_other_events(guard, request).await
    }

    /// The version-check gate. `Ok(false)` drops the batch as stale;
    /// conflicts are resolved in place before `Ok(true)`.
    async fn apply_other_events_version_checking(
        &self,
        guard: &mut ExecutionGuard<C>,
        request: &ReplicateEventsRequest,
    ) -> Result<bool, ReplicationError> {
        let incoming_version = request.version;
        let (last_write_version, last_write_event_id, start_timestamp) = {
            let state = guard.load().await.map_err(ReplicationError::Store)?;
            (
                state.last_write_version(),
                state.replication_state().last_write_event_id,
                state.execution_info().start_timestamp,
            )
        };

        if last_write_version > incoming_version {
            info!(%last_write_version, "Dropping stale replication task");
            return Ok(false);
        }
        if last_write_version == incoming_version {
            return Ok(true);
        }

        // First event after a failover into a new active cluster.
        let metadata = self.shard.cluster_metadata();
        let Some(previous_active) = metadata.cluster_for_version(last_write_version) else {
            warn!(%last_write_version, "No cluster owns the previous write version");
            return Err(ReplicationError::MissingReplicationInfo);
        };
        info!(%previous_active, "First event after failover");
        let Some(replication_info) = request.replication_info.get(previous_active).copied() else {
            // A domain can fail away and back without generating events;
            // congruent versions mean no other cluster wrote in between.
            if metadata.is_version_from_same_cluster(incoming_version, last_write_version) {
                return Ok(true);
            }
            warn!(%previous_active, "No replication info for previous active cluster");
            return Err(ReplicationError::MissingReplicationInfo);
        };

        if replication_info.last_event_id > last_write_event_id {
            warn!(
                remote = %replication_info.last_event_id,
                local = %last_write_event_id,
                "Conflict detected but cannot resolve"
            );
            return Err(ReplicationError::CorruptedReplicationInfo);
        }
        if replication_info.last_event_id < last_write_event_id {
            info!(
                reset_to = %replication_info.last_event_id,
                "Conflict detected, resolving by reset"
            );
            self.conflict_resolution_terminate_continue_as_new(guard).await?;
            conflict_resolver::reset(
                &self.shard,
                guard,
                RequestId::generate(),
                replication_info.last_event_id.next(),
                start_timestamp,
            )
            .await
            .map_err(ReplicationError::Store)?;
            info!("Completed resetting workflow execution");
        }
        Ok(true)
    }

    /// Ordering decision: duplicate, out-of-order (bounce or buffer), or
    /// in-order apply + buffer flush.
    async fn apply_other_events(
        &self,
        guard: &mut ExecutionGuard<C>,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        let buffered_limit = self.shard.config().buffered_events_limit;
        let local_next = guard
            .load()
            .await
            .map_err(ReplicationError::Store)?
            .next_event_id();

        if request.first_event_id < local_next {
            debug!(%local_next, "Dropping duplicate replication task");
            return Ok(());
        }
        if request.first_event_id > local_next {
            debug!(%local_next, "Out-of-order replication task");
            if !request.force_buffer_events {
                return Err(ReplicationError::RetryBufferEvents);
            }
            let state = guard.load().await.map_err(ReplicationError::Store)?;
            state
                .buffer_replication_task(
                    BufferedReplicationBatch {
                        first_event_id: request.first_event_id,
                        next_event_id: request.next_event_id,
                        version: request.version,
                        events: request.history.clone(),
                        new_run_events: request.new_run_history.clone(),
                    },
                    buffered_limit,
                )
                .map_err(ReplicationError::Store)?;
            // Persist the buffer without advancing the state machine; no
            // replication tasks are emitted for a standby write.
            return guard.persist_buffer().await.map_err(ReplicationError::Store);
        }

        self.apply_replication_task(
            guard,
            &BatchView {
                source_cluster: request.source_cluster.clone(),
                version: request.version,
                history: &request.history,
                new_run_history: request.new_run_history.as_deref(),
            },
        )
        .await?;
        self.flush_buffer(guard).await
    }

    /// Feeds one in-order batch through the state builder and commits it.
    async fn apply_replication_task(
        &self,
        guard: &mut ExecutionGuard<C>,
        batch: &BatchView<'_>,
    ) -> Result<(), ReplicationError> {
        if batch.history.is_empty() {
            return Ok(());
        }
        let domain_id = guard.domain_id();
        let execution = guard.execution().clone();
        let builder = StateBuilder::new(self.shard.config().history_retention);

        let state = guard
            .state()
            .ok_or_else(|| StoreError::Internal("state not loaded".to_string()))
            .map_err(ReplicationError::Store)?;
        let outcome = builder
            .apply_events(
                state,
                domain_id,
                &execution,
                batch.history,
                batch.new_run_history,
            )
            .map_err(ReplicationError::Store)?;

        // Continue-as-new: the successor run's record goes in first, under
        // its own transaction.
        if let Some(new_run) = &outcome.new_run {
            let transaction_id = self.shard.next_transaction_id();
            replicate_continue_as_new(
                &self.shard,
                execution.run_id,
                &new_run.state,
                &new_run.events,
                new_run.transfer_tasks.clone(),
                new_run.timer_tasks.clone(),
                transaction_id,
            )
            .await
            .map_err(ReplicationError::Store)?;
        }

        let first = &batch.history[0];
        let last_event = outcome.last_event.clone();
        let transfer_tasks = outcome.transfer_tasks.clone();
        let timer_tasks = outcome.timer_tasks.clone();

        if matches!(first.attributes, EventAttributes::WorkflowExecutionStarted(_)) {
            self.replicate_workflow_started(guard, batch, &last_event, transfer_tasks.clone(), timer_tasks.clone())
                .await?;
        } else {
            let state = guard
                .state()
                .ok_or_else(|| StoreError::Internal("state not loaded".to_string()))
                .map_err(ReplicationError::Store)?;
            let source = self.remote_source(&batch.source_cluster);
            state.update_replication_state_last_event_id(
                source,
                batch.version,
                last_event.event_id,
            );
            let transaction_id = self.shard.next_transaction_id();
            guard
                .replicate_workflow_execution(
                    batch.history,
                    batch.version,
                    transfer_tasks.clone(),
                    timer_tasks.clone(),
                    transaction_id,
                )
                .await
                .map_err(ReplicationError::Store)?;
        }

        // Advance this shard's view of the source cluster's progress and
        // wake the processors for the standby tasks just written.
        let watermark = last_event.timestamp - self.shard.config().standby_cluster_delay;
        self.shard.set_current_time(&batch.source_cluster, watermark);
        self.notifier
            .notify_transfer_tasks(&batch.source_cluster, &transfer_tasks);
        self.notifier
            .notify_timer_tasks(&batch.source_cluster, &timer_tasks);
        Ok(())
    }

    /// Start-event replication: append the first batch, then create the
    /// execution record, branching on whoever got there first. Every
    /// non-AlreadyStarted failure after the append deletes the appended
    /// batch so no orphan history is left behind.
    async fn replicate_workflow_started(
        &self,
        guard: &mut ExecutionGuard<C>,
        batch: &BatchView<'_>,
        last_event: &HistoryEvent,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
    ) -> Result<(), ReplicationError> {
        let domain_id = guard.domain_id();
        let execution = guard.execution().clone();
        let incoming_version = batch.history[0].version;
        let first_event_id = batch.history[0].event_id;

        {
            let source = self.remote_source(&batch.source_cluster);
            let state = guard
                .state()
                .ok_or_else(|| StoreError::Internal("state not loaded".to_string()))
                .map_err(ReplicationError::Store)?;
            state.update_replication_state_last_event_id(
                source,
                incoming_version,
                last_event.event_id,
            );
        }

        let encoded =
            concepts::events::encode_event_batch(batch.history).map_err(StoreError::from)?;
        let transaction_id = self.shard.next_transaction_id();
        self.shard
            .history_store()
            .append_history_events(concepts::storage::AppendHistoryEventsRequest {
                domain_id,
                execution: execution.clone(),
                first_event_id,
                event_batch_version: incoming_version,
                range_id: self.shard.range_id(),
                transaction_id,
                events: encoded,
                overwrite: false,
            })
            .await
            .map_err(ReplicationError::Store)?;

        self.shard.allocate_task_ids(&mut timer_tasks, &mut transfer_tasks);
        let snapshot = guard
            .state()
            .ok_or_else(|| StoreError::Internal("state not loaded".to_string()))
            .map_err(ReplicationError::Store)?
            .snapshot_for_commit();

        let create = |mode: concepts::storage::CreateMode, previous_run_id: Option<RunId>| {
            concepts::storage::CreateWorkflowExecutionRequest {
                snapshot: snapshot.clone(),
                range_id: self.shard.range_id(),
                mode,
                previous_run_id,
                transfer_tasks: transfer_tasks.clone(),
                timer_tasks: timer_tasks.clone(),
            }
        };

        let created = self
            .shard
            .execution_store()
            .create_workflow_execution(create(concepts::storage::CreateMode::BrandNew, None))
            .await;
        let err = match created {
            Ok(()) => {
                self.mark_guard_committed(guard)?;
                return Ok(());
            }
            Err(err) => err,
        };

        let StoreError::AlreadyStarted {
            current_run_id,
            state: current_state,
            close_status: _,
            start_version: current_start_version,
            request_id: _,
        } = err
        else {
            self.delete_appended_history(&domain_id, &execution).await;
            return Err(ReplicationError::Store(err));
        };

        if current_run_id == execution.run_id {
            debug!("Dropping duplicate start replication task");
            // The speculative state never became a record; drop it so the
            // next load reads whatever actually exists.
            guard.clear();
            return Ok(());
        }

        if current_state == WorkflowState::Completed {
            if current_start_version > incoming_version {
                info!("Dropping stale start replication task");
                self.delete_appended_history(&domain_id, &execution).await;
                guard.clear();
                return Ok(());
            }
            self.shard
                .execution_store()
                .create_workflow_execution(create(
                    concepts::storage::CreateMode::WithPreviousRunId,
                    Some(current_run_id),
                ))
                .await
                .map_err(ReplicationError::Store)?;
            self.mark_guard_committed(guard)?;
            return Ok(());
        }

        // Current run is still running.
        if current_start_version > incoming_version {
            info!("Dropping stale start replication task");
            self.delete_appended_history(&domain_id, &execution).await;
            guard.clear();
            return Ok(());
        }
        if current_start_version == incoming_version {
            self.flush_current_workflow_buffer(domain_id, &execution.workflow_id)
                .await?;
            return Err(ReplicationError::RetryExistingWorkflow);
        }

        // The remote active cluster cannot know about the locally running
        // workflow; terminate it and take its place.
        info!(%current_run_id, "Terminating current run superseded by higher-version start");
        match self
            .terminate_workflow(domain_id, &execution.workflow_id, current_run_id)
            .await
        {
            Ok(()) | Err(ReplicationError::Store(StoreError::NotFound)) => {}
            Err(err) => return Err(err),
        }
        self.shard
            .execution_store()
            .create_workflow_execution(create(
                concepts::storage::CreateMode::WithPreviousRunId,
                Some(current_run_id),
            ))
            .await
            .map_err(ReplicationError::Store)?;
        self.mark_guard_committed(guard)?;
        Ok(())
    }

    /// Drains parked batches while the next one lines up with the cursor.
    /// Each batch is deleted from the buffer before applying, so the
    /// removal commits atomically with the apply.
    pub async fn flush_buffer(&self, guard: &mut ExecutionGuard<C>) -> Result<(), ReplicationError> {
        loop {
            let batch = {
                let state = guard.load().await.map_err(ReplicationError::Store)?;
                if !state.has_buffered_replication_tasks() {
                    return Ok(());
                }
                let next_event_id = state.next_event_id();
                let Some(batch) = state.get_buffered_replication_task(next_event_id) else {
                    return Ok(());
                };
                let batch = batch.clone();
                state.delete_buffered_replication_task(next_event_id);
                batch
            };
            let source_cluster = self
                .shard
                .cluster_metadata()
                .cluster_for_version(batch.version)
                .cloned()
                .ok_or_else(|| {
                    StoreError::Internal(format!("no cluster owns version {}", batch.version))
                })
                .map_err(ReplicationError::Store)?;
            debug!(first = %batch.first_event_id, "Flushing buffered replication batch");
            self.apply_replication_task(
                guard,
                &BatchView {
                    source_cluster,
                    version: batch.version,
                    history: &batch.events,
                    new_run_history: batch.new_run_events.as_deref(),
                },
            )
            .await?;
        }
    }

    async fn flush_current_workflow_buffer(
        &self,
        domain_id: DomainId,
        workflow_id: &WorkflowId,
    ) -> Result<(), ReplicationError> {
        let mut current = self
            .cache
            .get_or_create(domain_id, workflow_id, None)
            .await
            .map_err(ReplicationError::Store)?;
        let result = async {
            current.load().await.map_err(ReplicationError::Store)?;
            Box::pin(self.flush_buffer(&mut current)).await
        }
        .await;
        current.finish(&result);
        result
    }

    /// When the run being reset closed as continue-as-new, its resurrected
    /// successor (if the chain links them) must be terminated before the
    /// reset, or two active descendants would race.
    async fn conflict_resolution_terminate_continue_as_new(
        &self,
        guard: &mut ExecutionGuard<C>,
    ) -> Result<(), ReplicationError> {
        let (running, close_status, domain_id, workflow_id, target_run_id) = {
            let state = guard.load().await.map_err(ReplicationError::Store)?;
            (
                state.is_running(),
                state.execution_info().close_status,
                state.domain_id(),
                state.workflow_id().clone(),
                state.run_id(),
            )
        };
        if running {
            debug!("Conflict resolution: workflow still running, no successor to terminate");
            return Ok(());
        }
        if close_status != CloseStatus::ContinuedAsNew {
            debug!("Conflict resolution: workflow closed without continue-as-new");
            return Ok(());
        }

        // The continued-as-new close guarantees current run != target run,
        // so locking the current run cannot deadlock.
        let (current_run_id, current_close_status) = {
            let mut current = self
                .cache
                .get_or_create(domain_id, &workflow_id, None)
                .await
                .map_err(ReplicationError::Store)?;
            let loaded = current
                .load()
                .await
                .map(|state| (state.run_id(), state.execution_info().close_status));
            current.finish(&loaded);
            loaded.map_err(ReplicationError::Store)?
        };
        if current_close_status != CloseStatus::Open {
            debug!("Conflict resolution: current workflow already finished");
            return Ok(());
        }

        // Walk the continue-as-new chain backwards from the current run.
        let walk_limit = self.shard.config().continue_as_new_walk_limit;
        let mut cursor = Some(current_run_id);
        let mut steps = 0usize;
        loop {
            let Some(run_id) = cursor else {
                debug!("Conflict resolution: current workflow is unrelated");
                return Ok(());
            };
            if run_id == target_run_id {
                break;
            }
            steps += 1;
            if steps > walk_limit {
                return Err(ReplicationError::Store(StoreError::Internal(format!(
                    "continue-as-new chain exceeded {walk_limit} links"
                ))));
            }
            cursor = self
                .continued_from(domain_id, &workflow_id, run_id)
                .await?;
        }

        info!(%current_run_id, "Terminating resurrected continue-as-new successor");
        self.terminate_workflow(domain_id, &workflow_id, current_run_id)
            .await
    }

    /// The run this one was continued from, read from its start event.
    async fn continued_from(
        &self,
        domain_id: DomainId,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<Option<RunId>, ReplicationError> {
        let response = self
            .shard
            .history_store()
            .read_history(ReadHistoryRequest {
                domain_id,
                execution: WorkflowExecution::new(workflow_id.clone(), run_id),
                first_event_id: EventId::FIRST,
                next_event_id: EventId::FIRST.next(),
                page_size: 1,
                page_token: None,
            })
            .await
            .map_err(ReplicationError::Store)?;
        let batch = response
            .batches
            .first()
            .ok_or_else(|| StoreError::Internal("no history found for run".to_string()))
            .map_err(ReplicationError::Store)?;
        let events = decode_event_batch(batch).map_err(StoreError::from)?;
        let first = events
            .first()
            .ok_or_else(|| StoreError::Internal("empty first history batch".to_string()))
            .map_err(ReplicationError::Store)?;
        match &first.attributes {
            EventAttributes::WorkflowExecutionStarted(attributes) => {
                Ok(attributes.continued_run_id)
            }
            _ => Err(ReplicationError::Store(StoreError::Internal(
                "first event is not a start event".to_string(),
            ))),
        }
    }

    /// Terminates a locally running workflow (same workflow id, same
    /// shard), committing the terminate event at the run's own version.
    async fn terminate_workflow(
        &self,
        domain_id: DomainId,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<(), ReplicationError> {
        let mut victim = self
            .cache
            .get_or_create(domain_id, workflow_id, Some(run_id))
            .await
            .map_err(ReplicationError::Store)?;
        let result = async {
            let now = self.shard.now();
            let retention = self.shard.config().history_retention;
            let execution = victim.execution().clone();
            let state = victim.load().await.map_err(ReplicationError::Store)?;
            if state
                .add_workflow_terminated_event(CONFLICT_TERMINATE_REASON, now)
                .is_none()
            {
                return Ok(());
            }
            let version = state.current_version();
            let (close_transfer, delete_timer) =
                close_execution_tasks(domain_id, &execution, version, now, retention);
            let transaction_id = self.shard.next_transaction_id();
            victim
                .update_workflow_execution(vec![close_transfer], vec![delete_timer], transaction_id)
                .await
                .map_err(ReplicationError::Store)
        }
        .await;
        victim.finish(&result);
        result
    }

    fn remote_source(&self, source_cluster: &ClusterName) -> Option<ClusterName> {
        if source_cluster == self.shard.cluster_metadata().current_cluster() {
            None
        } else {
            Some(source_cluster.clone())
        }
    }

    async fn delete_appended_history(&self, domain_id: &DomainId, execution: &WorkflowExecution) {
        if let Err(err) = self
            .shard
            .history_store()
            .delete_history(domain_id, execution)
            .await
        {
            warn!(%err, "Failed to delete orphaned history after start replication failure");
        }
    }

    fn mark_guard_committed(&self, guard: &mut ExecutionGuard<C>) -> Result<(), ReplicationError> {
        guard
            .state()
            .ok_or_else(|| StoreError::Internal("state not loaded".to_string()))
            .map_err(ReplicationError::Store)?
            .mark_committed();
        Ok(())
    }
}
