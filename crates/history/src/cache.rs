//! Workflow-execution cache and the per-run execution context.
//!
//! Every mutation of a run happens under that run's exclusive lock,
//! obtained through [`ExecutionCache::get_or_create`]. The returned
//! [`ExecutionGuard`] is both the lock and the load/commit facade over the
//! stores: committing serializes locally appended events, appends them to
//! the history store, then compare-and-swaps the execution record on
//! (`next_event_id`, shard range). Dropping the guard keeps the cached
//! state; finishing it with an error invalidates the cache so the next
//! holder reloads.

use crate::mutable_state::MutableState;
use crate::shard::ShardContext;
use concepts::events::{encode_event_batch, HistoryEvent, TimeoutKind};
use concepts::storage::{
    AppendHistoryEventsRequest, CreateMode, CreateWorkflowExecutionRequest, StoreError,
    UpdateWorkflowExecutionRequest,
};
use concepts::tasks::{TimerTask, TimerTaskKind, TransferTask, TransferTaskKind};
use concepts::time::ClockFn;
use concepts::{DomainId, FailoverVersion, RunId, TaskId, WorkflowExecution, WorkflowId};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, trace};

#[derive(Default)]
struct CachedState {
    mutable_state: Option<MutableState>,
}

type CacheKey = (DomainId, WorkflowId, RunId);

pub struct ExecutionCache<C: ClockFn> {
    shard: Arc<ShardContext<C>>,
    entries: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<CachedState>>>>,
}

impl<C: ClockFn> ExecutionCache<C> {
    #[must_use]
    pub fn new(shard: Arc<ShardContext<C>>) -> Self {
        Self {
            shard,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the run (an absent `run_id` means "current run"), pins the
    /// cache entry and acquires its exclusive lock.
    pub async fn get_or_create(
        &self,
        domain_id: DomainId,
        workflow_id: &WorkflowId,
        run_id: Option<RunId>,
    ) -> Result<ExecutionGuard<C>, StoreError> {
        let run_id = match run_id {
            Some(run_id) => run_id,
            None => {
                self.shard
                    .execution_store()
                    .get_current_execution(&domain_id, workflow_id)
                    .await?
                    .run_id
            }
        };
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry((domain_id, workflow_id.clone(), run_id))
                .or_default()
                .clone()
        };
        let guard = entry.lock_owned().await;
        trace!(%workflow_id, %run_id, "Acquired execution lock");
        Ok(ExecutionGuard {
            shard: self.shard.clone(),
            domain_id,
            execution: WorkflowExecution::new(workflow_id.clone(), run_id),
            guard,
        })
    }

    /// Drop cache entries that nothing currently references.
    pub fn evict_unreferenced(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| Arc::strong_count(entry) > 1);
    }

    #[must_use]
    pub fn shard(&self) -> &Arc<ShardContext<C>> {
        &self.shard
    }
}

pub struct ExecutionGuard<C: ClockFn> {
    shard: Arc<ShardContext<C>>,
    domain_id: DomainId,
    execution: WorkflowExecution,
    guard: tokio::sync::OwnedMutexGuard<CachedState>,
}

impl<C: ClockFn> ExecutionGuard<C> {
    #[must_use]
    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    #[must_use]
    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Loads mutable state through the cache, reading the store only when
    /// the cache is cold.
    pub async fn load(&mut self) -> Result<&mut MutableState, StoreError> {
        if self.guard.mutable_state.is_none() {
            let snapshot = self
                .shard
                .execution_store()
                .get_workflow_execution(
                    &self.domain_id,
                    &self.execution.workflow_id,
                    &self.execution.run_id,
                )
                .await?;
            self.guard.mutable_state = Some(MutableState::from_snapshot(snapshot));
        }
        Ok(self.guard.mutable_state.as_mut().expect("just loaded"))
    }

    /// The loaded state, if any. Commit operations require a prior
    /// [`Self::load`].
    #[must_use]
    pub fn state(&mut self) -> Option<&mut MutableState> {
        self.guard.mutable_state.as_mut()
    }

    /// Drop cached state so the next load re-reads the store.
    pub fn clear(&mut self) {
        self.guard.mutable_state = None;
    }

    /// Replace the cached state, e.g. after a conflict-resolution rebuild.
    pub fn install(&mut self, state: MutableState) {
        self.guard.mutable_state = Some(state);
    }

    /// Release the lock, invalidating the cached state if the holder's
    /// work failed.
    pub fn finish<T, E>(mut self, result: &Result<T, E>) {
        if result.is_err() {
            self.clear();
        }
    }

    fn loaded_state(&mut self) -> Result<&mut MutableState, StoreError> {
        self.guard
            .mutable_state
            .as_mut()
            .ok_or_else(|| StoreError::Internal("mutable state not loaded".to_string()))
    }

    /// Appends a DecisionTaskScheduled event if none is pending; returns
    /// the transfer/timer tasks the new decision generates.
    pub fn schedule_new_decision(
        &mut self,
    ) -> Result<(Vec<TransferTask>, Vec<TimerTask>), StoreError> {
        let domain_id = self.domain_id;
        let execution = self.execution.clone();
        let now = self.shard.now();
        let state = self.loaded_state()?;
        if state.has_pending_decision() {
            return Ok((Vec::new(), Vec::new()));
        }
        let Some(decision) = state.add_decision_task_scheduled_event(now) else {
            return Ok((Vec::new(), Vec::new()));
        };
        let version = state.current_version();
        let info = state.execution_info();
        let task_list = info
            .sticky_task_list
            .clone()
            .unwrap_or_else(|| info.task_list.clone());
        let sticky_timeout = info
            .sticky_task_list
            .as_ref()
            .map(|_| info.sticky_schedule_to_start_timeout);
        let transfer = vec![TransferTask {
            task_id: TaskId(0),
            domain_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id,
            version,
            kind: TransferTaskKind::Decision {
                schedule_id: decision.schedule_id,
                task_list,
            },
        }];
        let timer = match sticky_timeout {
            Some(timeout) => vec![TimerTask {
                task_id: TaskId(0),
                visibility_timestamp: now + timeout,
                domain_id,
                workflow_id: execution.workflow_id,
                run_id: execution.run_id,
                version,
                kind: TimerTaskKind::DecisionTimeout {
                    event_id: decision.schedule_id,
                    timeout_kind: TimeoutKind::ScheduleToStart,
                    schedule_attempt: decision.attempt,
                },
            }],
            None => Vec::new(),
        };
        Ok((transfer, timer))
    }

    /// Active-path commit: append locally produced events, then CAS the
    /// execution record. Invalidates the cache on every failure so the
    /// retry loop reloads.
    #[instrument(skip_all, fields(execution = %self.execution))]
    pub async fn update_workflow_execution(
        &mut self,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), StoreError> {
        let result = self
            .update_workflow_execution_inner(&mut transfer_tasks, &mut timer_tasks, transaction_id)
            .await;
        if result.is_err() {
            self.clear();
        }
        result
    }

    async fn update_workflow_execution_inner(
        &mut self,
        transfer_tasks: &mut Vec<TransferTask>,
        timer_tasks: &mut Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), StoreError> {
        let domain_id = self.domain_id;
        let execution = self.execution.clone();
        let range_id = self.shard.range_id();

        let state = self.loaded_state()?;
        let batch_version = state.current_version();
        let new_events = state.take_pending_events();
        let condition = state.condition();
        let snapshot = state.snapshot_for_commit();

        if let Some(first) = new_events.first() {
            let encoded = encode_event_batch(&new_events)?;
            self.shard
                .history_store()
                .append_history_events(AppendHistoryEventsRequest {
                    domain_id,
                    execution: execution.clone(),
                    first_event_id: first.event_id,
                    event_batch_version: batch_version,
                    range_id,
                    transaction_id,
                    events: encoded,
                    // A prior attempt of this same commit may have appended
                    // this batch before losing the execution CAS.
                    overwrite: true,
                })
                .await?;
        }

        self.shard.allocate_task_ids(timer_tasks, transfer_tasks);
        self.shard
            .execution_store()
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot,
                condition,
                range_id,
                transfer_tasks: std::mem::take(transfer_tasks),
                timer_tasks: std::mem::take(timer_tasks),
            })
            .await?;
        self.loaded_state()?.mark_committed();
        debug!("Committed workflow execution update");
        Ok(())
    }

    /// Standby commit of a replicated batch: the remote events are appended
    /// verbatim and the record is CAS-updated. No replication tasks are
    /// emitted from a standby write.
    #[instrument(skip_all, fields(execution = %self.execution))]
    pub async fn replicate_workflow_execution(
        &mut self,
        events: &[HistoryEvent],
        batch_version: FailoverVersion,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), StoreError> {
        let domain_id = self.domain_id;
        let execution = self.execution.clone();
        let range_id = self.shard.range_id();

        let first = events
            .first()
            .ok_or_else(|| StoreError::Internal("empty replication batch".to_string()))?;
        let encoded = encode_event_batch(events)?;
        self.shard
            .history_store()
            .append_history_events(AppendHistoryEventsRequest {
                domain_id,
                execution: execution.clone(),
                first_event_id: first.event_id,
                event_batch_version: batch_version,
                range_id,
                transaction_id,
                events: encoded,
                overwrite: true,
            })
            .await?;

        let state = self.loaded_state()?;
        state.execution_info_mut().last_first_event_id = first.event_id;
        let condition = state.condition();
        let snapshot = state.snapshot_for_commit();
        self.shard.allocate_task_ids(&mut timer_tasks, &mut transfer_tasks);
        let result = self
            .shard
            .execution_store()
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot,
                condition,
                range_id,
                transfer_tasks,
                timer_tasks,
            })
            .await;
        match result {
            Ok(()) => {
                self.loaded_state()?.mark_committed();
                Ok(())
            }
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }

    /// Persist mutable state without appending events or advancing the
    /// event-id cursor; used to park buffered out-of-order batches.
    #[instrument(skip_all, fields(execution = %self.execution))]
    pub async fn persist_buffer(&mut self) -> Result<(), StoreError> {
        let range_id = self.shard.range_id();
        let state = self.loaded_state()?;
        let condition = state.condition();
        let snapshot = state.snapshot_for_commit();
        let result = self
            .shard
            .execution_store()
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot,
                condition,
                range_id,
                transfer_tasks: Vec::new(),
                timer_tasks: Vec::new(),
            })
            .await;
        if let Err(err) = result {
            self.clear();
            return Err(err);
        }
        self.loaded_state()?.mark_committed();
        Ok(())
    }
}

/// Commit the successor run of a replicated continue-as-new: append its
/// first history batch and create its execution record chained to the
/// closing run.
pub async fn replicate_continue_as_new<C: ClockFn>(
    shard: &ShardContext<C>,
    previous_run_id: RunId,
    new_state: &MutableState,
    new_run_events: &[HistoryEvent],
    mut transfer_tasks: Vec<TransferTask>,
    mut timer_tasks: Vec<TimerTask>,
    transaction_id: i64,
) -> Result<(), StoreError> {
    let snapshot = new_state.snapshot_for_commit();
    let domain_id = snapshot.execution_info.domain_id;
    let execution = WorkflowExecution::new(
        snapshot.execution_info.workflow_id.clone(),
        snapshot.execution_info.run_id,
    );
    let first = new_run_events
        .first()
        .ok_or_else(|| StoreError::Internal("empty new-run history".to_string()))?;
    let encoded = encode_event_batch(new_run_events)?;
    shard
        .history_store()
        .append_history_events(AppendHistoryEventsRequest {
            domain_id,
            execution,
            first_event_id: first.event_id,
            event_batch_version: first.version,
            range_id: shard.range_id(),
            transaction_id,
            events: encoded,
            overwrite: false,
        })
        .await?;
    shard.allocate_task_ids(&mut timer_tasks, &mut transfer_tasks);
    shard
        .execution_store()
        .create_workflow_execution(CreateWorkflowExecutionRequest {
            snapshot,
            range_id: shard.range_id(),
            mode: CreateMode::WithPreviousRunId,
            previous_run_id: Some(previous_run_id),
            transfer_tasks,
            timer_tasks,
        })
        .await
}
