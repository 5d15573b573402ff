//! In-memory projection of one workflow run: the authoritative working copy
//! between a store read and the next compare-and-swap commit.
//!
//! Mutators come in two families. `add_*` operations are the active path:
//! they append new history events locally and advance `next_event_id`.
//! `replicate_*` operations are the standby path: they fold events received
//! from a remote cluster into the projection without generating history.
//! Both families are idempotence-checked: a mutator whose precondition no
//! longer holds returns `None` so duplicate timer fires and replays degrade
//! to no-ops.

use chrono::{DateTime, Utc};
use concepts::cluster::ClusterName;
use concepts::events::{
    ActivityTaskScheduledAttributes, DecisionFailedCause, EventAttributes, HistoryEvent,
    TimeoutKind, WorkflowExecutionStartedAttributes,
};
use concepts::execution::{
    timer_task_status, ActivityInfo, BufferedReplicationBatch, CloseStatus, DecisionInfo,
    ExecutionInfo, ReplicationInfo, ReplicationState, TimerInfo, WorkflowSnapshot, WorkflowState,
};
use concepts::storage::StoreError;
use concepts::{
    DomainId, EventId, FailoverVersion, RequestId, RunId, WorkflowExecution, WorkflowId,
};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One entry of a timer scan: the next deadline of a pending user timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTimerDescriptor {
    pub timer_id: String,
    pub started_id: EventId,
    pub expiry: DateTime<Utc>,
    pub task_created: bool,
}

/// One candidate timeout of a pending activity. `attempt` is captured when
/// the descriptor list is built; a retry created mid-scan bumps the
/// activity's attempt past it, which is how superseded timeouts are
/// recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTimerDescriptor {
    pub schedule_id: EventId,
    pub timeout_kind: TimeoutKind,
    pub expiry: DateTime<Utc>,
    pub attempt: u32,
    pub task_created: bool,
}

/// Outcome of [`MutableState::create_retry_timer`]: the activity retry that
/// replaces a timeout event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBackoff {
    pub fire_time: DateTime<Utc>,
    pub attempt: u32,
    pub version: FailoverVersion,
}

#[derive(Debug)]
pub struct MutableState {
    snapshot: WorkflowSnapshot,
    /// `next_event_id` as persisted at load / last commit; the CAS
    /// condition for the next one.
    condition: EventId,
    pending_events: Vec<HistoryEvent>,
    /// Attempt to use for the next scheduled decision after a
    /// timeout/failure in the same commit.
    next_decision_attempt: u32,
}

impl MutableState {
    #[must_use]
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        let condition = snapshot.execution_info.next_event_id;
        Self {
            snapshot,
            condition,
            pending_events: Vec::new(),
            next_decision_attempt: 0,
        }
    }

    /// Empty state for a run about to be built from replicated events.
    #[must_use]
    pub fn new_for_replication(
        domain_id: DomainId,
        execution: WorkflowExecution,
        version: FailoverVersion,
    ) -> Self {
        let info = ExecutionInfo {
            domain_id,
            workflow_id: execution.workflow_id,
            run_id: execution.run_id,
            parent: None,
            workflow_type: String::new(),
            task_list: String::new(),
            sticky_task_list: None,
            sticky_schedule_to_start_timeout: Duration::ZERO,
            execution_timeout: Duration::ZERO,
            decision_timeout: Duration::ZERO,
            state: WorkflowState::Created,
            close_status: CloseStatus::Open,
            next_event_id: EventId::FIRST,
            last_first_event_id: EventId::EMPTY,
            last_processed_event_id: EventId::EMPTY,
            start_timestamp: DateTime::<Utc>::UNIX_EPOCH,
            continued_run_id: None,
            create_request_id: RequestId::generate(),
        };
        Self {
            snapshot: WorkflowSnapshot {
                execution_info: info,
                replication_state: ReplicationState::new(version),
                activities: HashMap::new(),
                user_timers: HashMap::new(),
                decision: None,
                buffered_batches: BTreeMap::new(),
            },
            condition: EventId::FIRST,
            pending_events: Vec::new(),
            next_decision_attempt: 0,
        }
    }

    // --- accessors -------------------------------------------------------

    #[must_use]
    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.snapshot.execution_info
    }

    #[must_use]
    pub fn execution_info_mut(&mut self) -> &mut ExecutionInfo {
        &mut self.snapshot.execution_info
    }

    #[must_use]
    pub fn replication_state(&self) -> &ReplicationState {
        &self.snapshot.replication_state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.snapshot.execution_info.is_running()
    }

    #[must_use]
    pub fn next_event_id(&self) -> EventId {
        self.snapshot.execution_info.next_event_id
    }

    #[must_use]
    pub fn condition(&self) -> EventId {
        self.condition
    }

    #[must_use]
    pub fn current_version(&self) -> FailoverVersion {
        self.snapshot.replication_state.current_version
    }

    #[must_use]
    pub fn last_write_version(&self) -> FailoverVersion {
        self.snapshot.replication_state.last_write_version
    }

    #[must_use]
    pub fn has_pending_decision(&self) -> bool {
        self.snapshot.decision.is_some()
    }

    #[must_use]
    pub fn decision(&self, schedule_id: EventId) -> Option<&DecisionInfo> {
        self.snapshot
            .decision
            .as_ref()
            .filter(|di| di.schedule_id == schedule_id)
    }

    /// The pending decision that has already been started.
    #[must_use]
    pub fn in_flight_decision(&self) -> Option<&DecisionInfo> {
        self.snapshot.decision.as_ref().filter(|di| di.is_started())
    }

    #[must_use]
    pub fn activity(&self, schedule_id: EventId) -> Option<&ActivityInfo> {
        self.snapshot.activities.get(&schedule_id)
    }

    #[must_use]
    pub fn user_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.snapshot.user_timers.get(timer_id)
    }

    #[must_use]
    pub fn is_sticky_task_list_enabled(&self) -> bool {
        self.snapshot.execution_info.sticky_task_list.is_some()
    }

    #[must_use]
    pub fn snapshot(&self) -> &WorkflowSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn snapshot_for_commit(&self) -> WorkflowSnapshot {
        self.snapshot.clone()
    }

    #[must_use]
    pub fn has_pending_events(&self) -> bool {
        !self.pending_events.is_empty()
    }

    #[must_use]
    pub fn pending_events(&self) -> &[HistoryEvent] {
        &self.pending_events
    }

    /// Drain locally appended events for the commit batch, stamping the
    /// replication watermark to the last of them.
    #[must_use]
    pub fn take_pending_events(&mut self) -> Vec<HistoryEvent> {
        let events = std::mem::take(&mut self.pending_events);
        if let Some(last) = events.last() {
            let rs = &mut self.snapshot.replication_state;
            rs.last_write_version = rs.current_version;
            rs.last_write_event_id = last.event_id;
            self.snapshot.execution_info.last_first_event_id = events[0].event_id;
        }
        events
    }

    /// Mark the current `next_event_id` as persisted; the next commit's CAS
    /// condition starts here.
    pub fn mark_committed(&mut self) {
        self.condition = self.snapshot.execution_info.next_event_id;
    }

    // --- active mutators -------------------------------------------------

    fn append_event(&mut self, now: DateTime<Utc>, attributes: EventAttributes) -> EventId {
        let event_id = self.snapshot.execution_info.next_event_id;
        self.snapshot.execution_info.next_event_id = event_id.next();
        self.pending_events.push(HistoryEvent {
            event_id,
            timestamp: now,
            version: self.snapshot.replication_state.current_version,
            attributes,
        });
        event_id
    }

    fn close(&mut self, status: CloseStatus) {
        self.snapshot.execution_info.state = WorkflowState::Completed;
        self.snapshot.execution_info.close_status = status;
    }

    /// No-op (`None`) when the timer is no longer pending, so a duplicate
    /// fire of the same persisted task cannot double-append.
    pub fn add_timer_fired_event(
        &mut self,
        started_id: EventId,
        timer_id: &str,
        now: DateTime<Utc>,
    ) -> Option<EventId> {
        let timer = self.snapshot.user_timers.get(timer_id)?;
        if timer.started_id != started_id {
            return None;
        }
        self.snapshot.user_timers.remove(timer_id);
        Some(self.append_event(
            now,
            EventAttributes::TimerFired {
                timer_id: timer_id.to_string(),
                started_event_id: started_id,
            },
        ))
    }

    /// No-op (`None`) when the activity is not in the expected state.
    pub fn add_activity_task_timed_out_event(
        &mut self,
        schedule_id: EventId,
        started_id: EventId,
        timeout_kind: TimeoutKind,
        details: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Option<EventId> {
        let activity = self.snapshot.activities.get(&schedule_id)?;
        if activity.started_id != started_id {
            return None;
        }
        self.snapshot.activities.remove(&schedule_id);
        Some(self.append_event(
            now,
            EventAttributes::ActivityTaskTimedOut {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                timeout_kind,
                details,
            },
        ))
    }

    pub fn add_decision_task_timed_out_event(
        &mut self,
        schedule_id: EventId,
        now: DateTime<Utc>,
    ) -> Option<EventId> {
        let decision = self.snapshot.decision.take()?;
        if decision.schedule_id != schedule_id {
            self.snapshot.decision = Some(decision);
            return None;
        }
        self.next_decision_attempt = decision.attempt + 1;
        Some(self.append_event(
            now,
            EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id: schedule_id,
                started_event_id: decision.started_id,
                timeout_kind: TimeoutKind::StartToClose,
            },
        ))
    }

    /// Schedule-to-start timeout of a sticky decision: clears stickiness so
    /// the rescheduled decision lands on the original task list.
    pub fn add_decision_task_schedule_to_start_timed_out_event(
        &mut self,
        schedule_id: EventId,
        now: DateTime<Utc>,
    ) -> Option<EventId> {
        let decision = self.snapshot.decision.take()?;
        if decision.schedule_id != schedule_id || decision.is_started() {
            self.snapshot.decision = Some(decision);
            return None;
        }
        self.snapshot.execution_info.sticky_task_list = None;
        self.snapshot.execution_info.sticky_schedule_to_start_timeout = Duration::ZERO;
        self.next_decision_attempt = decision.attempt + 1;
        Some(self.append_event(
            now,
            EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id: schedule_id,
                started_event_id: EventId::EMPTY,
                timeout_kind: TimeoutKind::ScheduleToStart,
            },
        ))
    }

    pub fn add_decision_task_failed_event(
        &mut self,
        schedule_id: EventId,
        started_id: EventId,
        cause: DecisionFailedCause,
        now: DateTime<Utc>,
    ) -> Option<EventId> {
        let decision = self.snapshot.decision.take()?;
        if decision.schedule_id != schedule_id {
            self.snapshot.decision = Some(decision);
            return None;
        }
        self.next_decision_attempt = decision.attempt + 1;
        Some(self.append_event(
            now,
            EventAttributes::DecisionTaskFailed {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                cause,
            },
        ))
    }

    /// Closes the workflow as timed out; `None` when already closed.
    pub fn add_timeout_workflow_event(&mut self, now: DateTime<Utc>) -> Option<EventId> {
        if !self.is_running() {
            return None;
        }
        let event_id = self.append_event(now, EventAttributes::WorkflowExecutionTimedOut);
        self.close(CloseStatus::TimedOut);
        Some(event_id)
    }

    pub fn add_workflow_terminated_event(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<EventId> {
        if !self.is_running() {
            return None;
        }
        let event_id = self.append_event(
            now,
            EventAttributes::WorkflowExecutionTerminated {
                reason: reason.to_string(),
            },
        );
        self.close(CloseStatus::Terminated);
        Some(event_id)
    }

    /// Appends a DecisionTaskScheduled event if none is pending. The task
    /// list is the sticky one when stickiness is enabled.
    pub fn add_decision_task_scheduled_event(&mut self, now: DateTime<Utc>) -> Option<DecisionInfo> {
        if self.snapshot.decision.is_some() || !self.is_running() {
            return None;
        }
        let info = &self.snapshot.execution_info;
        let task_list = info
            .sticky_task_list
            .clone()
            .unwrap_or_else(|| info.task_list.clone());
        let timeout = info.decision_timeout;
        let attempt = std::mem::take(&mut self.next_decision_attempt);
        let schedule_id = self.append_event(
            now,
            EventAttributes::DecisionTaskScheduled {
                task_list,
                start_to_close_timeout: timeout,
                attempt,
            },
        );
        let decision = DecisionInfo {
            version: self.snapshot.replication_state.current_version,
            schedule_id,
            started_id: EventId::EMPTY,
            request_id: None,
            start_to_close_timeout: timeout,
            attempt,
            scheduled_time: now,
            started_time: None,
        };
        self.snapshot.decision = Some(decision.clone());
        Some(decision)
    }

    /// Consumes retry budget for an activity that just timed out. `None`
    /// means no budget remains and the caller proceeds to fail the
    /// activity; `Some` carries the backoff deadline and the bumped
    /// attempt.
    pub fn create_retry_timer(
        &mut self,
        schedule_id: EventId,
        now: DateTime<Utc>,
    ) -> Option<RetryBackoff> {
        let activity = self.snapshot.activities.get_mut(&schedule_id)?;
        let policy = activity.retry_policy.as_ref()?;
        if policy.maximum_attempts != 0 && activity.attempt + 1 >= policy.maximum_attempts {
            return None;
        }
        if let Some(expiration) = activity.retry_expiration_time {
            if now >= expiration {
                return None;
            }
        }
        let backoff = policy.backoff_for_attempt(activity.attempt);
        let fire_time = now + backoff;
        if let Some(expiration) = activity.retry_expiration_time {
            if fire_time >= expiration {
                return None;
            }
        }
        activity.attempt += 1;
        activity.started_id = EventId::EMPTY;
        activity.timer_task_status = timer_task_status::NONE;
        debug!(%schedule_id, attempt = activity.attempt, %fire_time, "Activity retry scheduled");
        Some(RetryBackoff {
            fire_time,
            attempt: activity.attempt,
            version: activity.version,
        })
    }

    pub fn update_activity(&mut self, activity: ActivityInfo) {
        self.snapshot.activities.insert(activity.schedule_id, activity);
    }

    pub fn update_user_timer(&mut self, timer: TimerInfo) {
        self.snapshot.user_timers.insert(timer.timer_id.clone(), timer);
    }

    pub fn mark_user_timer_task_created(&mut self, timer_id: &str) {
        if let Some(timer) = self.snapshot.user_timers.get_mut(timer_id) {
            timer.task_created = true;
        }
    }

    /// Records that a timeout timer task now exists for the activity.
    /// `visibility` is truncated to seconds; heartbeat timer creation is
    /// deduped on it.
    pub fn mark_activity_timer_created(
        &mut self,
        schedule_id: EventId,
        timeout_kind: TimeoutKind,
        visibility: DateTime<Utc>,
    ) {
        if let Some(activity) = self.snapshot.activities.get_mut(&schedule_id) {
            activity.timer_task_status |= created_bit(timeout_kind);
            activity.last_timeout_visibility = visibility.timestamp();
        }
    }

    pub fn clear_heartbeat_timer_created(&mut self, schedule_id: EventId) {
        if let Some(activity) = self.snapshot.activities.get_mut(&schedule_id) {
            activity.timer_task_status &= !timer_task_status::CREATED_HEARTBEAT;
        }
    }

    // --- timer scans -----------------------------------------------------

    /// Pending user timers in deadline order.
    #[must_use]
    pub fn user_timer_sequence(&self) -> Vec<UserTimerDescriptor> {
        let mut timers: Vec<UserTimerDescriptor> = self
            .snapshot
            .user_timers
            .values()
            .map(|timer| UserTimerDescriptor {
                timer_id: timer.timer_id.clone(),
                started_id: timer.started_id,
                expiry: timer.expiry,
                task_created: timer.task_created,
            })
            .collect();
        timers.sort_by(|a, b| (a.expiry, a.started_id).cmp(&(b.expiry, b.started_id)));
        timers
    }

    /// Candidate timeout timers of all pending activities in deadline
    /// order. Built once per scan; attempts are captured at build time.
    #[must_use]
    pub fn activity_timer_sequence(&self) -> Vec<ActivityTimerDescriptor> {
        let mut timers = Vec::new();
        for activity in self.snapshot.activities.values() {
            let mut push = |timeout_kind: TimeoutKind, expiry: DateTime<Utc>| {
                timers.push(ActivityTimerDescriptor {
                    schedule_id: activity.schedule_id,
                    timeout_kind,
                    expiry,
                    attempt: activity.attempt,
                    task_created: activity.timer_task_status & created_bit(timeout_kind) != 0,
                });
            };
            push(
                TimeoutKind::ScheduleToClose,
                activity.scheduled_time + activity.schedule_to_close_timeout,
            );
            if activity.is_started() {
                push(
                    TimeoutKind::StartToClose,
                    activity.started_time + activity.start_to_close_timeout,
                );
                if let Some(heartbeat_timeout) = activity.heartbeat_timeout {
                    let reference = activity.last_heartbeat_time.max(activity.started_time);
                    push(TimeoutKind::Heartbeat, reference + heartbeat_timeout);
                }
            } else {
                push(
                    TimeoutKind::ScheduleToStart,
                    activity.scheduled_time + activity.schedule_to_start_timeout,
                );
            }
        }
        timers.sort_by(|a, b| (a.expiry, a.schedule_id).cmp(&(b.expiry, b.schedule_id)));
        timers
    }

    // --- replication buffer ----------------------------------------------

    pub fn buffer_replication_task(
        &mut self,
        batch: BufferedReplicationBatch,
        limit: usize,
    ) -> Result<(), StoreError> {
        let incoming = batch.events.len();
        if self.snapshot.buffered_event_count() + incoming > limit {
            return Err(StoreError::BufferedEventsLimitExceeded);
        }
        self.snapshot.buffered_batches.insert(batch.first_event_id, batch);
        Ok(())
    }

    #[must_use]
    pub fn has_buffered_replication_tasks(&self) -> bool {
        !self.snapshot.buffered_batches.is_empty()
    }

    #[must_use]
    pub fn get_buffered_replication_task(
        &self,
        next_event_id: EventId,
    ) -> Option<&BufferedReplicationBatch> {
        self.snapshot.buffered_batches.get(&next_event_id)
    }

    pub fn delete_buffered_replication_task(&mut self, first_event_id: EventId) {
        self.snapshot.buffered_batches.remove(&first_event_id);
    }

    // --- replication-state bookkeeping -----------------------------------

    /// Records the high-water mark of events applied from a remote cluster
    /// and moves the local write watermark onto them.
    pub fn update_replication_state_last_event_id(
        &mut self,
        source_cluster: Option<ClusterName>,
        version: FailoverVersion,
        last_event_id: EventId,
    ) {
        let rs = &mut self.snapshot.replication_state;
        rs.current_version = version;
        rs.last_write_version = version;
        rs.last_write_event_id = last_event_id;
        if let Some(cluster) = source_cluster {
            rs.last_replication_info.insert(
                cluster,
                ReplicationInfo {
                    version,
                    last_event_id,
                },
            );
        }
    }

    pub fn set_current_version(&mut self, version: FailoverVersion) {
        self.snapshot.replication_state.current_version = version;
    }

    // --- replicate-side mutators (standby fold) --------------------------

    /// Folds one remote event's position into the projection. Specific
    /// `replicate_*` methods handle the per-kind state changes.
    pub fn replicate_event_applied(&mut self, event: &HistoryEvent) {
        self.snapshot.execution_info.next_event_id = event.event_id.next();
        self.snapshot.replication_state.current_version = event.version;
    }

    pub fn replicate_workflow_started(
        &mut self,
        attributes: &WorkflowExecutionStartedAttributes,
        event: &HistoryEvent,
    ) {
        let info = &mut self.snapshot.execution_info;
        info.workflow_type = attributes.workflow_type.clone();
        info.task_list = attributes.task_list.clone();
        info.execution_timeout = attributes.execution_timeout;
        info.decision_timeout = attributes.decision_timeout;
        info.state = WorkflowState::Running;
        info.close_status = CloseStatus::Open;
        info.start_timestamp = event.timestamp;
        info.last_first_event_id = event.event_id;
        info.continued_run_id = attributes.continued_run_id;
        info.parent = attributes.parent.clone();
        info.create_request_id = attributes.request_id;
        self.snapshot.replication_state.start_version = event.version;
    }

    pub fn replicate_decision_scheduled(
        &mut self,
        event: &HistoryEvent,
        start_to_close_timeout: Duration,
        attempt: u32,
    ) -> DecisionInfo {
        let decision = DecisionInfo {
            version: event.version,
            schedule_id: event.event_id,
            started_id: EventId::EMPTY,
            request_id: None,
            start_to_close_timeout,
            attempt,
            scheduled_time: event.timestamp,
            started_time: None,
        };
        self.snapshot.decision = Some(decision.clone());
        decision
    }

    pub fn replicate_decision_started(
        &mut self,
        scheduled_event_id: EventId,
        request_id: RequestId,
        event: &HistoryEvent,
    ) {
        if let Some(decision) = self.snapshot.decision.as_mut() {
            if decision.schedule_id == scheduled_event_id {
                decision.started_id = event.event_id;
                decision.started_time = Some(event.timestamp);
                decision.request_id = Some(request_id);
                decision.version = event.version;
            }
        }
    }

    pub fn replicate_decision_finished(&mut self, scheduled_event_id: EventId) {
        if self
            .snapshot
            .decision
            .as_ref()
            .is_some_and(|di| di.schedule_id == scheduled_event_id)
        {
            self.snapshot.decision = None;
        }
    }

    pub fn replicate_timer_started(
        &mut self,
        timer_id: &str,
        start_to_fire_timeout: Duration,
        event: &HistoryEvent,
    ) {
        self.snapshot.user_timers.insert(
            timer_id.to_string(),
            TimerInfo {
                version: event.version,
                timer_id: timer_id.to_string(),
                started_id: event.event_id,
                expiry: event.timestamp + start_to_fire_timeout,
                task_created: true,
            },
        );
    }

    pub fn replicate_timer_fired(&mut self, timer_id: &str) {
        self.snapshot.user_timers.remove(timer_id);
    }

    pub fn replicate_activity_scheduled(
        &mut self,
        attributes: &ActivityTaskScheduledAttributes,
        event: &HistoryEvent,
    ) {
        let retry_expiration_time = attributes
            .retry_policy
            .as_ref()
            .and_then(|policy| policy.expiration_interval)
            .map(|interval| event.timestamp + interval);
        self.snapshot.activities.insert(
            event.event_id,
            ActivityInfo {
                version: event.version,
                schedule_id: event.event_id,
                scheduled_time: event.timestamp,
                started_id: EventId::EMPTY,
                started_time: DateTime::<Utc>::UNIX_EPOCH,
                activity_id: attributes.activity_id.clone(),
                task_list: attributes.task_list.clone(),
                domain: attributes.domain.clone(),
                schedule_to_close_timeout: attributes.schedule_to_close_timeout,
                schedule_to_start_timeout: attributes.schedule_to_start_timeout,
                start_to_close_timeout: attributes.start_to_close_timeout,
                heartbeat_timeout: attributes.heartbeat_timeout,
                last_heartbeat_time: DateTime::<Utc>::UNIX_EPOCH,
                details: None,
                attempt: 0,
                retry_policy: attributes.retry_policy.clone(),
                retry_expiration_time,
                timer_task_status: timer_task_status::NONE,
                last_timeout_visibility: 0,
            },
        );
    }

    pub fn replicate_activity_started(&mut self, scheduled_event_id: EventId, event: &HistoryEvent) {
        if let Some(activity) = self.snapshot.activities.get_mut(&scheduled_event_id) {
            activity.started_id = event.event_id;
            activity.started_time = event.timestamp;
            activity.version = event.version;
        }
    }

    pub fn replicate_activity_finished(&mut self, scheduled_event_id: EventId) {
        self.snapshot.activities.remove(&scheduled_event_id);
    }

    pub fn replicate_workflow_closed(&mut self, status: CloseStatus) {
        self.close(status);
    }

    pub fn replicate_workflow_continued_as_new(&mut self, new_run_id: RunId) {
        self.close(CloseStatus::ContinuedAsNew);
        // The successor run links back through its own started event; the
        // closed run does not record the forward pointer.
        let _ = new_run_id;
    }

    // --- identity helpers ------------------------------------------------

    #[must_use]
    pub fn workflow_execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(
            self.snapshot.execution_info.workflow_id.clone(),
            self.snapshot.execution_info.run_id,
        )
    }

    #[must_use]
    pub fn domain_id(&self) -> DomainId {
        self.snapshot.execution_info.domain_id
    }

    #[must_use]
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.snapshot.execution_info.workflow_id
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.snapshot.execution_info.run_id
    }
}

fn created_bit(timeout_kind: TimeoutKind) -> u32 {
    match timeout_kind {
        TimeoutKind::StartToClose => timer_task_status::CREATED_START_TO_CLOSE,
        TimeoutKind::ScheduleToStart => timer_task_status::CREATED_SCHEDULE_TO_START,
        TimeoutKind::ScheduleToClose => timer_task_status::CREATED_SCHEDULE_TO_CLOSE,
        TimeoutKind::Heartbeat => timer_task_status::CREATED_HEARTBEAT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concepts::events::RetryPolicy;

    fn started_state() -> MutableState {
        let domain_id = DomainId::generate();
        let execution = WorkflowExecution::new(WorkflowId::from("wf"), RunId::generate());
        let mut ms =
            MutableState::new_for_replication(domain_id, execution, FailoverVersion(1));
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let attributes = WorkflowExecutionStartedAttributes {
            workflow_type: "order".to_string(),
            task_list: "orders".to_string(),
            execution_timeout: Duration::from_secs(3600),
            decision_timeout: Duration::from_secs(10),
            request_id: RequestId::generate(),
            continued_run_id: None,
            parent: None,
        };
        let event = HistoryEvent {
            event_id: EventId::FIRST,
            timestamp: now,
            version: FailoverVersion(1),
            attributes: EventAttributes::WorkflowExecutionStarted(attributes.clone()),
        };
        ms.replicate_workflow_started(&attributes, &event);
        ms.replicate_event_applied(&event);
        ms
    }

    fn pending_timer(ms: &mut MutableState, timer_id: &str, started_id: i64, expiry_secs: i64) {
        ms.update_user_timer(TimerInfo {
            version: FailoverVersion(1),
            timer_id: timer_id.to_string(),
            started_id: EventId(started_id),
            expiry: DateTime::from_timestamp(expiry_secs, 0).unwrap(),
            task_created: false,
        });
    }

    #[test]
    fn timer_fired_is_idempotent() {
        let mut ms = started_state();
        pending_timer(&mut ms, "t1", 5, 1_700_000_100);
        let now = DateTime::from_timestamp(1_700_000_101, 0).unwrap();
        assert!(ms.add_timer_fired_event(EventId(5), "t1", now).is_some());
        // Duplicate fire of the same persisted task is a no-op.
        assert!(ms.add_timer_fired_event(EventId(5), "t1", now).is_none());
        assert_eq!(ms.pending_events().len(), 1);
    }

    #[test]
    fn user_timer_sequence_is_in_deadline_order() {
        let mut ms = started_state();
        pending_timer(&mut ms, "late", 6, 1_700_000_300);
        pending_timer(&mut ms, "early", 5, 1_700_000_100);
        let sequence = ms.user_timer_sequence();
        assert_eq!(sequence[0].timer_id, "early");
        assert_eq!(sequence[1].timer_id, "late");
    }

    #[test]
    fn retry_timer_consumes_budget_and_bumps_attempt() {
        let mut ms = started_state();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let attributes = ActivityTaskScheduledAttributes {
            activity_id: "a1".to_string(),
            activity_type: "charge".to_string(),
            task_list: "orders".to_string(),
            domain: None,
            schedule_to_close_timeout: Duration::from_secs(300),
            schedule_to_start_timeout: Duration::from_secs(30),
            start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: None,
            retry_policy: Some(RetryPolicy {
                initial_interval: Duration::from_secs(5),
                backoff_coefficient: 2.0,
                maximum_interval: Duration::from_secs(60),
                maximum_attempts: 3,
                expiration_interval: None,
            }),
        };
        let scheduled = HistoryEvent {
            event_id: EventId(2),
            timestamp: now,
            version: FailoverVersion(1),
            attributes: EventAttributes::ActivityTaskScheduled(attributes.clone()),
        };
        ms.replicate_activity_scheduled(&attributes, &scheduled);
        let backoff = ms.create_retry_timer(EventId(2), now).unwrap();
        assert_eq!(backoff.attempt, 1);
        assert_eq!(backoff.fire_time, now + Duration::from_secs(5));
        let backoff = ms.create_retry_timer(EventId(2), now).unwrap();
        assert_eq!(backoff.attempt, 2);
        assert_eq!(backoff.fire_time, now + Duration::from_secs(10));
        // Third attempt would reach maximum_attempts.
        assert!(ms.create_retry_timer(EventId(2), now).is_none());
    }

    #[test]
    fn buffer_respects_the_event_limit() {
        let mut ms = started_state();
        let batch = |first: i64, count: usize| BufferedReplicationBatch {
            first_event_id: EventId(first),
            next_event_id: EventId(first + count as i64),
            version: FailoverVersion(1),
            events: (0..count)
                .map(|i| HistoryEvent {
                    event_id: EventId(first + i as i64),
                    timestamp: DateTime::<Utc>::UNIX_EPOCH,
                    version: FailoverVersion(1),
                    attributes: EventAttributes::TimerFired {
                        timer_id: "t".to_string(),
                        started_event_id: EventId(first - 1),
                    },
                })
                .collect(),
            new_run_events: None,
        };
        ms.buffer_replication_task(batch(10, 3), 4).unwrap();
        let err = ms.buffer_replication_task(batch(20, 2), 4).unwrap_err();
        assert_eq!(err, StoreError::BufferedEventsLimitExceeded);
        assert!(ms.get_buffered_replication_task(EventId(10)).is_some());
        assert!(ms.get_buffered_replication_task(EventId(11)).is_none());
    }

    #[test]
    fn schedule_to_start_timeout_clears_stickiness() {
        let mut ms = started_state();
        ms.execution_info_mut().sticky_task_list = Some("sticky-worker-1".to_string());
        let now = DateTime::from_timestamp(1_700_000_010, 0).unwrap();
        let decision = ms.add_decision_task_scheduled_event(now).unwrap();
        assert_eq!(decision.attempt, 0);
        let event_id = ms
            .add_decision_task_schedule_to_start_timed_out_event(decision.schedule_id, now)
            .unwrap();
        assert!(event_id.is_set());
        assert!(!ms.is_sticky_task_list_enabled());
        // The replacement decision escalates the attempt and goes to the
        // original task list.
        let retry = ms.add_decision_task_scheduled_event(now).unwrap();
        assert_eq!(retry.attempt, 1);
    }
}
