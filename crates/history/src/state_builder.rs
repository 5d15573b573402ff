//! Folds replicated history events into mutable state and derives the
//! standby task records (timers, transfer tasks) those events imply, so a
//! failover processor finds the same work a live active side would have
//! persisted.

use crate::mutable_state::MutableState;
use chrono::{DateTime, Utc};
use concepts::events::{EventAttributes, HistoryEvent, TimeoutKind};
use concepts::execution::CloseStatus;
use concepts::storage::StoreError;
use concepts::tasks::{TimerTask, TimerTaskKind, TransferTask, TransferTaskKind};
use concepts::{DomainId, EventId, TaskId, WorkflowExecution};
use std::time::Duration;
use tracing::trace;

pub struct StateBuilder {
    retention: Duration,
}

#[derive(Debug)]
pub struct NewRunOutcome {
    pub state: MutableState,
    pub events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

#[derive(Debug)]
pub struct ApplyOutcome {
    pub last_event: HistoryEvent,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    /// Present when the batch ends in continue-as-new; the successor run's
    /// record must be committed before the closing batch.
    pub new_run: Option<NewRunOutcome>,
}

impl StateBuilder {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }

    /// Applies one remote batch to `state`. Event ids must be contiguous
    /// from the state's `next_event_id`; the caller has already made that
    /// ordering decision.
    pub fn apply_events(
        &self,
        state: &mut MutableState,
        domain_id: DomainId,
        execution: &WorkflowExecution,
        history: &[HistoryEvent],
        new_run_history: Option<&[HistoryEvent]>,
    ) -> Result<ApplyOutcome, StoreError> {
        let last_event = history
            .last()
            .cloned()
            .ok_or_else(|| StoreError::Internal("empty history batch".to_string()))?;
        let mut transfer_tasks = Vec::new();
        let mut timer_tasks = Vec::new();
        let mut new_run = None;

        for event in history {
            trace!(event_id = %event.event_id, kind = event.attributes.kind(), "Applying event");
            match &event.attributes {
                EventAttributes::WorkflowExecutionStarted(attributes) => {
                    state.replicate_workflow_started(attributes, event);
                    timer_tasks.push(timer_task(
                        domain_id,
                        execution,
                        event,
                        event.timestamp + attributes.execution_timeout,
                        TimerTaskKind::WorkflowTimeout,
                    ));
                }
                EventAttributes::DecisionTaskScheduled {
                    task_list,
                    start_to_close_timeout,
                    attempt,
                } => {
                    let decision =
                        state.replicate_decision_scheduled(event, *start_to_close_timeout, *attempt);
                    transfer_tasks.push(TransferTask {
                        task_id: TaskId(0),
                        domain_id,
                        workflow_id: execution.workflow_id.clone(),
                        run_id: execution.run_id,
                        version: event.version,
                        kind: TransferTaskKind::Decision {
                            schedule_id: decision.schedule_id,
                            task_list: task_list.clone(),
                        },
                    });
                }
                EventAttributes::DecisionTaskStarted {
                    scheduled_event_id,
                    request_id,
                } => {
                    state.replicate_decision_started(*scheduled_event_id, *request_id, event);
                    if let Some(decision) = state.decision(*scheduled_event_id) {
                        let timeout = decision.start_to_close_timeout;
                        let attempt = decision.attempt;
                        timer_tasks.push(timer_task(
                            domain_id,
                            execution,
                            event,
                            event.timestamp + timeout,
                            TimerTaskKind::DecisionTimeout {
                                event_id: *scheduled_event_id,
                                timeout_kind: TimeoutKind::StartToClose,
                                schedule_attempt: attempt,
                            },
                        ));
                    }
                }
                EventAttributes::DecisionTaskCompleted {
                    scheduled_event_id, ..
                }
                | EventAttributes::DecisionTaskTimedOut {
                    scheduled_event_id, ..
                }
                | EventAttributes::DecisionTaskFailed {
                    scheduled_event_id, ..
                } => {
                    state.replicate_decision_finished(*scheduled_event_id);
                }
                EventAttributes::TimerStarted {
                    timer_id,
                    start_to_fire_timeout,
                    ..
                } => {
                    state.replicate_timer_started(timer_id, *start_to_fire_timeout, event);
                    timer_tasks.push(timer_task(
                        domain_id,
                        execution,
                        event,
                        event.timestamp + *start_to_fire_timeout,
                        TimerTaskKind::UserTimer {
                            event_id: event.event_id,
                        },
                    ));
                }
                EventAttributes::TimerFired { timer_id, .. } => {
                    state.replicate_timer_fired(timer_id);
                }
                EventAttributes::ActivityTaskScheduled(attributes) => {
                    state.replicate_activity_scheduled(attributes, event);
                    state.mark_activity_timer_created(
                        event.event_id,
                        TimeoutKind::ScheduleToStart,
                        event.timestamp + attributes.schedule_to_start_timeout,
                    );
                    timer_tasks.push(timer_task(
                        domain_id,
                        execution,
                        event,
                        event.timestamp + attributes.schedule_to_start_timeout,
                        TimerTaskKind::ActivityTimeout {
                            event_id: event.event_id,
                            timeout_kind: TimeoutKind::ScheduleToStart,
                            schedule_attempt: 0,
                        },
                    ));
                }
                EventAttributes::ActivityTaskStarted {
                    scheduled_event_id, ..
                } => {
                    state.replicate_activity_started(*scheduled_event_id, event);
                    if let Some(activity) = state.activity(*scheduled_event_id) {
                        let expiry = event.timestamp + activity.start_to_close_timeout;
                        let attempt = activity.attempt;
                        state.mark_activity_timer_created(
                            *scheduled_event_id,
                            TimeoutKind::StartToClose,
                            expiry,
                        );
                        timer_tasks.push(timer_task(
                            domain_id,
                            execution,
                            event,
                            expiry,
                            TimerTaskKind::ActivityTimeout {
                                event_id: *scheduled_event_id,
                                timeout_kind: TimeoutKind::StartToClose,
                                schedule_attempt: attempt,
                            },
                        ));
                    }
                }
                EventAttributes::ActivityTaskCompleted {
                    scheduled_event_id, ..
                }
                | EventAttributes::ActivityTaskTimedOut {
                    scheduled_event_id, ..
                } => {
                    state.replicate_activity_finished(*scheduled_event_id);
                }
                EventAttributes::WorkflowExecutionCompleted { .. } => {
                    state.replicate_workflow_closed(CloseStatus::Completed);
                    timer_tasks.push(self.delete_history_task(domain_id, execution, event));
                }
                EventAttributes::WorkflowExecutionFailed { .. } => {
                    state.replicate_workflow_closed(CloseStatus::Failed);
                    timer_tasks.push(self.delete_history_task(domain_id, execution, event));
                }
                EventAttributes::WorkflowExecutionTimedOut => {
                    state.replicate_workflow_closed(CloseStatus::TimedOut);
                    timer_tasks.push(self.delete_history_task(domain_id, execution, event));
                }
                EventAttributes::WorkflowExecutionTerminated { .. } => {
                    state.replicate_workflow_closed(CloseStatus::Terminated);
                    timer_tasks.push(self.delete_history_task(domain_id, execution, event));
                }
                EventAttributes::WorkflowExecutionContinuedAsNew {
                    new_run_id, ..
                } => {
                    state.replicate_workflow_continued_as_new(*new_run_id);
                    timer_tasks.push(self.delete_history_task(domain_id, execution, event));
                    let events = new_run_history.ok_or_else(|| {
                        StoreError::Internal(
                            "continue-as-new batch without new-run history".to_string(),
                        )
                    })?;
                    let first = events.first().ok_or_else(|| {
                        StoreError::Internal("empty new-run history".to_string())
                    })?;
                    let new_execution =
                        WorkflowExecution::new(execution.workflow_id.clone(), *new_run_id);
                    let mut new_state = MutableState::new_for_replication(
                        domain_id,
                        new_execution.clone(),
                        first.version,
                    );
                    let outcome = self.apply_events(
                        &mut new_state,
                        domain_id,
                        &new_execution,
                        events,
                        None,
                    )?;
                    new_run = Some(NewRunOutcome {
                        state: new_state,
                        events: events.to_vec(),
                        transfer_tasks: outcome.transfer_tasks,
                        timer_tasks: outcome.timer_tasks,
                    });
                }
            }
            state.replicate_event_applied(event);
        }

        Ok(ApplyOutcome {
            last_event,
            transfer_tasks,
            timer_tasks,
            new_run,
        })
    }

    fn delete_history_task(
        &self,
        domain_id: DomainId,
        execution: &WorkflowExecution,
        event: &HistoryEvent,
    ) -> TimerTask {
        timer_task(
            domain_id,
            execution,
            event,
            event.timestamp + self.retention,
            TimerTaskKind::DeleteHistory,
        )
    }
}

fn timer_task(
    domain_id: DomainId,
    execution: &WorkflowExecution,
    event: &HistoryEvent,
    visibility_timestamp: DateTime<Utc>,
    kind: TimerTaskKind,
) -> TimerTask {
    TimerTask {
        task_id: TaskId(0),
        visibility_timestamp,
        domain_id,
        workflow_id: execution.workflow_id.clone(),
        run_id: execution.run_id,
        version: event.version,
        kind,
    }
}

/// Tasks accompanying a workflow close on the active path.
pub(crate) fn close_execution_tasks(
    domain_id: DomainId,
    execution: &WorkflowExecution,
    version: concepts::FailoverVersion,
    now: DateTime<Utc>,
    retention: Duration,
) -> (TransferTask, TimerTask) {
    (
        TransferTask {
            task_id: TaskId(0),
            domain_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id,
            version,
            kind: TransferTaskKind::CloseExecution,
        },
        TimerTask {
            task_id: TaskId(0),
            visibility_timestamp: now + retention,
            domain_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id,
            version,
            kind: TimerTaskKind::DeleteHistory,
        },
    )
}
