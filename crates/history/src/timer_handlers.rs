//! Per-kind timer task handlers. Every state-mutating handler runs the
//! optimistic-concurrency loop: load, check still-running, mutate in
//! memory, commit; a CAS conflict reloads and retries up to the configured
//! attempt budget, after which the task surfaces `MaxAttemptsExceeded` and
//! stays unacked for a later cycle.

use crate::cache::ExecutionGuard;
use crate::state_builder::close_execution_tasks;
use crate::timer_processor::TimerQueueProcessor;
use crate::ProcessError;
use concepts::events::{DecisionFailedCause, TimeoutKind};
use concepts::storage::{AddActivityTaskRequest, StoreError};
use concepts::tasks::{TimerTask, TimerTaskKind, TransferTask};
use concepts::time::{ClockFn, Sleep};
use concepts::{EventId, TaskId, WorkflowExecution};
use tracing::{debug, warn};

impl<C: ClockFn, S: Sleep> TimerQueueProcessor<C, S> {
    pub(crate) async fn process_user_timer(&self, task: &TimerTask) -> Result<(), ProcessError> {
        let mut guard = self
            .cache
            .get_or_create(task.domain_id, &task.workflow_id, Some(task.run_id))
            .await?;
        let result = self.user_timer_locked(&mut guard, task).await;
        guard.finish(&result);
        result
    }

    async fn user_timer_locked(
        &self,
        guard: &mut ExecutionGuard<C>,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        for _attempt in 0..self.config().conditional_retry_count {
            let now = self.shard.now();
            let state = guard.load().await?;
            if !state.is_running() {
                return Ok(());
            }

            let mut timer_tasks = Vec::new();
            let mut schedule_new_decision = false;
            for descriptor in state.user_timer_sequence() {
                if descriptor.expiry <= task.visibility_timestamp {
                    state
                        .add_timer_fired_event(descriptor.started_id, &descriptor.timer_id, now)
                        .ok_or_else(|| {
                            ProcessError::Internal(format!(
                                "failed to add TimerFired for {}",
                                descriptor.timer_id
                            ))
                        })?;
                    schedule_new_decision = !state.has_pending_decision();
                } else {
                    // Exactly one persisted timer for the earliest pending
                    // user timer.
                    if !descriptor.task_created {
                        state.mark_user_timer_task_created(&descriptor.timer_id);
                        timer_tasks.push(TimerTask {
                            task_id: TaskId(0),
                            visibility_timestamp: descriptor.expiry,
                            domain_id: task.domain_id,
                            workflow_id: task.workflow_id.clone(),
                            run_id: task.run_id,
                            version: state.current_version(),
                            kind: TimerTaskKind::UserTimer {
                                event_id: descriptor.started_id,
                            },
                        });
                    }
                    break;
                }
            }

            if !state.has_pending_events() && timer_tasks.is_empty() {
                return Ok(());
            }
            match self
                .update_workflow_execution(guard, schedule_new_decision, false, timer_tasks)
                .await
            {
                Err(ProcessError::Store(StoreError::Conflict)) => continue,
                result => return result,
            }
        }
        Err(ProcessError::MaxAttemptsExceeded)
    }

    pub(crate) async fn process_activity_timeout(
        &self,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        let mut guard = self
            .cache
            .get_or_create(task.domain_id, &task.workflow_id, Some(task.run_id))
            .await?;
        let result = self.activity_timeout_locked(&mut guard, task).await;
        guard.finish(&result);
        result
    }

    async fn activity_timeout_locked(
        &self,
        guard: &mut ExecutionGuard<C>,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        // Activity expiry is judged against the shard's current time, not
        // the task's visibility: heartbeats may have moved deadlines since
        // this task was persisted.
        let reference_time = self.shard.now();
        for _attempt in 0..self.config().conditional_retry_count {
            let state = guard.load().await?;
            if !state.is_running() {
                return Ok(());
            }

            // A heartbeat timer task consumes its created bit so the scan
            // below can re-create from the refreshed heartbeat time.
            if let TimerTaskKind::ActivityTimeout {
                event_id,
                timeout_kind: TimeoutKind::Heartbeat,
                ..
            } = &task.kind
            {
                let refresh = state.activity(*event_id).is_some_and(|activity| {
                    activity.last_timeout_visibility <= task.visibility_timestamp.timestamp()
                });
                if refresh {
                    state.clear_heartbeat_timer_created(*event_id);
                }
            }

            let mut timer_tasks = Vec::new();
            let mut update_history = false;
            let mut create_new_timer = false;
            for descriptor in state.activity_timer_sequence() {
                let Some(activity) = state.activity(descriptor.schedule_id).cloned() else {
                    // Timed out earlier in this same scan.
                    continue;
                };
                if descriptor.expiry <= reference_time {
                    // A retry bumped the attempt past this descriptor;
                    // only the total-deadline timeout still applies.
                    if descriptor.attempt < activity.attempt
                        && descriptor.timeout_kind != TimeoutKind::ScheduleToClose
                    {
                        continue;
                    }
                    // Queue timeouts are not retryable; a larger
                    // schedule-to-start timeout is the fix, not a retry.
                    if descriptor.timeout_kind != TimeoutKind::ScheduleToStart {
                        if let Some(backoff) =
                            state.create_retry_timer(descriptor.schedule_id, reference_time)
                        {
                            debug!(
                                schedule_id = %descriptor.schedule_id,
                                attempt = backoff.attempt,
                                "Ignoring activity timeout, retry scheduled"
                            );
                            timer_tasks.push(TimerTask {
                                task_id: TaskId(0),
                                visibility_timestamp: backoff.fire_time,
                                domain_id: task.domain_id,
                                workflow_id: task.workflow_id.clone(),
                                run_id: task.run_id,
                                version: backoff.version,
                                kind: TimerTaskKind::ActivityRetry {
                                    event_id: descriptor.schedule_id,
                                    schedule_attempt: backoff.attempt,
                                },
                            });
                            create_new_timer = true;
                            continue;
                        }
                    }

                    let timed_out = match descriptor.timeout_kind {
                        TimeoutKind::ScheduleToClose => Some(None),
                        TimeoutKind::StartToClose if activity.is_started() => Some(None),
                        TimeoutKind::Heartbeat => Some(activity.details.clone()),
                        TimeoutKind::ScheduleToStart if !activity.is_started() => Some(None),
                        _ => None,
                    };
                    if let Some(details) = timed_out {
                        state
                            .add_activity_task_timed_out_event(
                                descriptor.schedule_id,
                                activity.started_id,
                                descriptor.timeout_kind,
                                details,
                                reference_time,
                            )
                            .ok_or_else(|| {
                                ProcessError::Internal(format!(
                                    "failed to add ActivityTaskTimedOut for {}",
                                    descriptor.schedule_id
                                ))
                            })?;
                        update_history = true;
                    }
                } else {
                    if !descriptor.task_created {
                        state.mark_activity_timer_created(
                            descriptor.schedule_id,
                            descriptor.timeout_kind,
                            descriptor.expiry,
                        );
                        timer_tasks.push(TimerTask {
                            task_id: TaskId(0),
                            visibility_timestamp: descriptor.expiry,
                            domain_id: task.domain_id,
                            workflow_id: task.workflow_id.clone(),
                            run_id: task.run_id,
                            version: activity.version,
                            kind: TimerTaskKind::ActivityTimeout {
                                event_id: descriptor.schedule_id,
                                timeout_kind: descriptor.timeout_kind,
                                schedule_attempt: activity.attempt,
                            },
                        });
                        create_new_timer = true;
                    }
                    break;
                }
            }

            if !update_history && !create_new_timer {
                return Ok(());
            }
            let schedule_new_decision = update_history && !state.has_pending_decision();
            match self
                .update_workflow_execution(guard, schedule_new_decision, false, timer_tasks)
                .await
            {
                Err(ProcessError::Store(StoreError::Conflict)) => continue,
                result => return result,
            }
        }
        Err(ProcessError::MaxAttemptsExceeded)
    }

    pub(crate) async fn process_decision_timeout(
        &self,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        let TimerTaskKind::DecisionTimeout {
            event_id: schedule_id,
            timeout_kind,
            schedule_attempt,
        } = &task.kind
        else {
            return Err(ProcessError::Internal("not a decision timeout task".to_string()));
        };
        let mut guard = self
            .cache
            .get_or_create(task.domain_id, &task.workflow_id, Some(task.run_id))
            .await?;
        let result = self
            .decision_timeout_locked(&mut guard, task, *schedule_id, *timeout_kind, *schedule_attempt)
            .await;
        guard.finish(&result);
        result
    }

    async fn decision_timeout_locked(
        &self,
        guard: &mut ExecutionGuard<C>,
        task: &TimerTask,
        schedule_id: EventId,
        timeout_kind: TimeoutKind,
        schedule_attempt: u32,
    ) -> Result<(), ProcessError> {
        for _attempt in 0..self.config().conditional_retry_count {
            let now = self.shard.now();
            let state = guard.load().await?;
            if !state.is_running() {
                return Ok(());
            }
            let Some(decision) = state.decision(schedule_id).cloned() else {
                debug!(%schedule_id, "Decision already resolved, dropping timeout task");
                return Ok(());
            };
            if !self.verify_task_version(&task.domain_id, decision.version, task.version)? {
                return Ok(());
            }

            let mut schedule_new_decision = false;
            match timeout_kind {
                TimeoutKind::StartToClose if decision.attempt == schedule_attempt => {
                    state
                        .add_decision_task_timed_out_event(schedule_id, now)
                        .ok_or_else(|| {
                            ProcessError::Internal("failed to add DecisionTaskTimedOut".to_string())
                        })?;
                    schedule_new_decision = true;
                }
                TimeoutKind::ScheduleToStart
                    if decision.attempt == schedule_attempt
                        && !decision.is_started()
                        && state.is_sticky_task_list_enabled() =>
                {
                    state
                        .add_decision_task_schedule_to_start_timed_out_event(schedule_id, now)
                        .ok_or_else(|| {
                            ProcessError::Internal(
                                "failed to add DecisionTaskScheduleToStartTimedOut".to_string(),
                            )
                        })?;
                    // Rescheduled on the original, non-sticky task list.
                    schedule_new_decision = true;
                }
                _ => {}
            }

            if !schedule_new_decision {
                return Ok(());
            }
            match self
                .update_workflow_execution(guard, true, false, Vec::new())
                .await
            {
                Err(ProcessError::Store(StoreError::Conflict)) => continue,
                result => return result,
            }
        }
        Err(ProcessError::MaxAttemptsExceeded)
    }

    pub(crate) async fn process_workflow_timeout(
        &self,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        let mut guard = self
            .cache
            .get_or_create(task.domain_id, &task.workflow_id, Some(task.run_id))
            .await?;
        let result = self.workflow_timeout_locked(&mut guard, task).await;
        guard.finish(&result);
        result
    }

    async fn workflow_timeout_locked(
        &self,
        guard: &mut ExecutionGuard<C>,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        for _attempt in 0..self.config().conditional_retry_count {
            let now = self.shard.now();
            let state = guard.load().await?;
            if !state.is_running() {
                return Ok(());
            }
            let start_version = state.replication_state().start_version;
            if !self.verify_task_version(&task.domain_id, start_version, task.version)? {
                return Ok(());
            }
            if state.add_timeout_workflow_event(now).is_none() {
                // Already closed; drop the timeout.
                return Ok(());
            }
            match self
                .update_workflow_execution(guard, false, true, Vec::new())
                .await
            {
                Err(ProcessError::Store(StoreError::Conflict)) => continue,
                result => return result,
            }
        }
        Err(ProcessError::MaxAttemptsExceeded)
    }

    /// Re-dispatches an activity to matching after its retry backoff. The
    /// execution lock is released before the outbound call.
    pub(crate) async fn process_activity_retry(
        &self,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        let TimerTaskKind::ActivityRetry {
            event_id: schedule_id,
            schedule_attempt,
        } = &task.kind
        else {
            return Err(ProcessError::Internal("not an activity retry task".to_string()));
        };
        let mut last_err = None;
        for _attempt in 0..self.config().conditional_retry_count {
            match self
                .activity_retry_once(task, *schedule_id, *schedule_attempt)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if matches!(err, ProcessError::Store(StoreError::ShardOwnershipLost)) {
                        return Err(err);
                    }
                    warn!(%err, "Activity retry dispatch failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(ProcessError::MaxAttemptsExceeded))
    }

    async fn activity_retry_once(
        &self,
        task: &TimerTask,
        schedule_id: EventId,
        schedule_attempt: u32,
    ) -> Result<(), ProcessError> {
        let mut guard = self
            .cache
            .get_or_create(task.domain_id, &task.workflow_id, Some(task.run_id))
            .await?;
        let outcome: Result<Option<AddActivityTaskRequest>, ProcessError> = {
            async {
                let state = guard.load().await?;
                if !state.is_running() {
                    return Ok(None);
                }
                let Some(activity) = state.activity(schedule_id) else {
                    return Ok(None);
                };
                if schedule_attempt < activity.attempt {
                    return Ok(None);
                }
                let version = activity.version;
                let task_list = activity.task_list.clone();
                let schedule_to_start_timeout = activity.schedule_to_start_timeout;
                let target_domain = activity.domain.clone();
                if !self.verify_task_version(&task.domain_id, version, task.version)? {
                    return Ok(None);
                }
                // Activities can target a foreign domain; resolve it by
                // name through the registry.
                let target_domain_id = match target_domain {
                    Some(name) => {
                        self.shard
                            .domains()
                            .entry_by_name(&name)
                            .ok_or_else(|| {
                                ProcessError::Internal(format!(
                                    "unable to re-schedule activity across domain {name}"
                                ))
                            })?
                            .id
                    }
                    None => task.domain_id,
                };
                Ok(Some(AddActivityTaskRequest {
                    domain_id: target_domain_id,
                    source_domain_id: task.domain_id,
                    execution: WorkflowExecution::new(task.workflow_id.clone(), task.run_id),
                    task_list,
                    schedule_id,
                    schedule_to_start_timeout,
                }))
            }
            .await
        };
        guard.finish(&outcome);
        let Some(request) = outcome? else {
            return Ok(());
        };
        // Lock already released; the matching call happens outside it.
        self.matching.add_activity_task(request).await?;
        Ok(())
    }

    pub(crate) async fn process_delete_history(
        &self,
        task: &TimerTask,
    ) -> Result<(), ProcessError> {
        let execution = WorkflowExecution::new(task.workflow_id.clone(), task.run_id);
        debug!(%execution, "Deleting closed workflow execution and its history");
        self.shard
            .execution_store()
            .delete_workflow_execution(&task.domain_id, &task.workflow_id, &task.run_id)
            .await?;
        self.shard
            .history_store()
            .delete_history(&task.domain_id, &execution)
            .await?;
        Ok(())
    }

    /// Shared commit wrapper: appends the decision/delete companion tasks,
    /// commits, and runs the stuck-workflow unblock protocol when the
    /// buffered-events limit is hit.
    pub(crate) async fn update_workflow_execution(
        &self,
        guard: &mut ExecutionGuard<C>,
        schedule_new_decision: bool,
        create_delete_task: bool,
        mut timer_tasks: Vec<TimerTask>,
    ) -> Result<(), ProcessError> {
        // A run whose replication buffer is over the limit cannot take new
        // events; run the unblock protocol and surface the limit error.
        let buffered = guard
            .state()
            .map(|state| state.snapshot().buffered_event_count())
            .unwrap_or(0);
        if buffered > self.config().buffered_events_limit {
            self.force_fail_stuck_decision(guard).await?;
            return Err(ProcessError::Store(StoreError::BufferedEventsLimitExceeded));
        }

        let mut transfer_tasks: Vec<TransferTask> = Vec::new();
        if schedule_new_decision {
            let (transfer, timer) = guard.schedule_new_decision()?;
            transfer_tasks.extend(transfer);
            timer_tasks.extend(timer);
        }
        if create_delete_task {
            let domain_id = guard.domain_id();
            let execution = guard.execution().clone();
            let now = self.shard.now();
            let retention = self.config().history_retention;
            let version = guard
                .state()
                .map(|state| state.current_version())
                .ok_or_else(|| ProcessError::Internal("state not loaded".to_string()))?;
            let (close_transfer, delete_timer) =
                close_execution_tasks(domain_id, &execution, version, now, retention);
            transfer_tasks.push(close_transfer);
            timer_tasks.push(delete_timer);
        }

        let transaction_id = self.shard.next_transaction_id();
        match guard
            .update_workflow_execution(transfer_tasks, timer_tasks.clone(), transaction_id)
            .await
        {
            Ok(()) => {
                self.notify_new_timers(&timer_tasks);
                Ok(())
            }
            Err(StoreError::ShardOwnershipLost) => {
                // Shard is stolen. Stop timer processing to reduce
                // duplicates.
                self.stop();
                Err(ProcessError::Store(StoreError::ShardOwnershipLost))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The run cannot take new events while its buffer is over the limit:
    /// fail the in-flight decision so the worker re-decides and the buffer
    /// can drain.
    async fn force_fail_stuck_decision(
        &self,
        guard: &mut ExecutionGuard<C>,
    ) -> Result<(), ProcessError> {
        guard.clear();
        let now = self.shard.now();
        let state = guard.load().await?;
        let Some(decision) = state.in_flight_decision().cloned() else {
            return Ok(());
        };
        warn!(
            schedule_id = %decision.schedule_id,
            "Force-failing in-flight decision to unblock buffered events"
        );
        state.add_decision_task_failed_event(
            decision.schedule_id,
            decision.started_id,
            DecisionFailedCause::ForceCloseDecision,
            now,
        );
        let (transfer, timer) = guard.schedule_new_decision()?;
        let transaction_id = self.shard.next_transaction_id();
        guard
            .update_workflow_execution(transfer, timer.clone(), transaction_id)
            .await?;
        self.notify_new_timers(&timer);
        Ok(())
    }
}
