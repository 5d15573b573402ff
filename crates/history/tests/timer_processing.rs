//! End-to-end timer queue scenarios against the in-memory store: firing,
//! retries, version filtering, shard fencing and the stuck-buffer unblock
//! protocol.

mod common;

use assert_matches::assert_matches;
use common::*;
use concepts::events::{EventAttributes, RetryPolicy, TimeoutKind};
use concepts::execution::{timer_task_status, BufferedReplicationBatch, CloseStatus};
use concepts::storage::StoreError;
use concepts::tasks::{TimerTask, TimerTaskKind};
use concepts::{EventId, FailoverVersion, RunId, WorkflowId};
use history::ProcessError;
use std::time::Duration;

#[tokio::test]
async fn user_timer_fires_and_schedules_a_decision() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("user-timer-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_user_timer(&mut snapshot, "t1", 5, at(100), 1, true);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(100),
        1,
        TimerTaskKind::UserTimer { event_id: EventId(5) },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;

    fx.clock.advance(Duration::from_secs(101));
    fx.processor.process(&task).await.unwrap();

    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    // TimerFired at 7, DecisionTaskScheduled at 8.
    assert_eq!(stored.execution_info.next_event_id, EventId(9));
    assert!(stored.user_timers.is_empty());
    let decision = stored.decision.expect("new decision scheduled");
    assert_eq!(decision.schedule_id, EventId(8));

    let events = fx.decoded_history(&workflow_id, run_id);
    assert_matches!(
        &events[0].attributes,
        EventAttributes::TimerFired { timer_id, started_event_id }
            if timer_id == "t1" && *started_event_id == EventId(5)
    );
    assert_matches!(&events[1].attributes, EventAttributes::DecisionTaskScheduled { .. });

    // The fired task is acked (deleted); the decision timer list contains
    // no sticky timeout because stickiness is off.
    assert!(fx
        .store
        .timer_tasks()
        .iter()
        .all(|t| t.kind != task.kind || t.task_id != task.task_id));
}

#[tokio::test]
async fn duplicate_user_timer_fire_is_a_no_op() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("dup-timer-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_user_timer(&mut snapshot, "t1", 5, at(100), 1, true);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(100),
        1,
        TimerTaskKind::UserTimer { event_id: EventId(5) },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(101));

    fx.processor.process(&task).await.unwrap();
    let after_first = fx.snapshot_of(&workflow_id, run_id).await;
    // Second fire of the same persisted task: mutable-state idempotence
    // turns it into a no-op commit-free pass.
    fx.processor.process(&task).await.unwrap();
    let after_second = fx.snapshot_of(&workflow_id, run_id).await;
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn expired_activity_with_budget_schedules_a_retry_instead_of_timing_out() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("activity-retry-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_activity(
        &mut snapshot,
        5,
        at(0),
        Some((6, at(0))),
        Duration::from_secs(50),
        Some(RetryPolicy {
            initial_interval: Duration::from_secs(5),
            backoff_coefficient: 1.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: 3,
            expiration_interval: None,
        }),
        timer_task_status::CREATED_START_TO_CLOSE,
        1,
    );
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(50),
        1,
        TimerTaskKind::ActivityTimeout {
            event_id: EventId(5),
            timeout_kind: TimeoutKind::StartToClose,
            schedule_attempt: 0,
        },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;

    fx.clock.advance(Duration::from_secs(50));
    fx.processor.process(&task).await.unwrap();

    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    // No timeout event was appended; the attempt was consumed instead.
    assert_eq!(stored.execution_info.next_event_id, EventId(7));
    let activity = stored.activities.get(&EventId(5)).expect("still pending");
    assert_eq!(activity.attempt, 1);
    assert!(!activity.is_started());

    let retry_tasks: Vec<TimerTask> = fx
        .store
        .timer_tasks()
        .into_iter()
        .filter(|t| matches!(t.kind, TimerTaskKind::ActivityRetry { .. }))
        .collect();
    assert_eq!(retry_tasks.len(), 1);
    assert_eq!(retry_tasks[0].visibility_timestamp, at(55));
    assert_matches!(
        retry_tasks[0].kind,
        TimerTaskKind::ActivityRetry { event_id, schedule_attempt }
            if event_id == EventId(5) && schedule_attempt == 1
    );
}

#[tokio::test]
async fn superseded_attempt_timers_are_skipped_except_total_deadline() {
    // One pass over an activity whose StartToClose (retryable) and
    // Heartbeat (superseded mid-scan) and ScheduleToClose (total deadline,
    // exhausted budget) deadlines have all passed.
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("attempt-table-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_activity(
        &mut snapshot,
        5,
        at(0),
        Some((6, at(0))),
        Duration::from_secs(50),
        Some(RetryPolicy {
            initial_interval: Duration::from_secs(5),
            backoff_coefficient: 1.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: 2,
            expiration_interval: None,
        }),
        timer_task_status::CREATED_START_TO_CLOSE,
        1,
    );
    {
        let activity = snapshot.activities.get_mut(&EventId(5)).unwrap();
        activity.heartbeat_timeout = Some(Duration::from_secs(55));
        activity.last_heartbeat_time = at(0);
        // Total deadline passes before the reference time below.
        activity.schedule_to_close_timeout = Duration::from_secs(60);
    }
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(50),
        1,
        TimerTaskKind::ActivityTimeout {
            event_id: EventId(5),
            timeout_kind: TimeoutKind::StartToClose,
            schedule_attempt: 0,
        },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;

    fx.clock.advance(Duration::from_secs(70));
    fx.processor.process(&task).await.unwrap();

    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    // StartToClose consumed the only retry (attempt 0 -> 1). Heartbeat was
    // built at attempt 0 and skipped once superseded. ScheduleToClose is
    // exempt from the attempt filter: with the budget exhausted it timed
    // the activity out.
    assert!(stored.activities.is_empty());
    let events = fx.decoded_history(&workflow_id, run_id);
    let timeouts: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.attributes {
            EventAttributes::ActivityTaskTimedOut { timeout_kind, .. } => Some(*timeout_kind),
            _ => None,
        })
        .collect();
    assert_eq!(timeouts, vec![TimeoutKind::ScheduleToClose]);
}

#[tokio::test]
async fn decision_start_to_close_timeout_reschedules_the_decision() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("decision-timeout-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_decision(&mut snapshot, 5, 6, 1);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(10),
        1,
        TimerTaskKind::DecisionTimeout {
            event_id: EventId(5),
            timeout_kind: TimeoutKind::StartToClose,
            schedule_attempt: 0,
        },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(11));

    fx.processor.process(&task).await.unwrap();

    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    let events = fx.decoded_history(&workflow_id, run_id);
    assert_matches!(
        &events[0].attributes,
        EventAttributes::DecisionTaskTimedOut { timeout_kind: TimeoutKind::StartToClose, .. }
    );
    let decision = stored.decision.expect("rescheduled");
    assert_eq!(decision.attempt, 1);
    assert!(!decision.is_started());
}

#[tokio::test]
async fn stale_decision_timeout_attempt_is_dropped() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("stale-decision-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_decision(&mut snapshot, 5, 6, 1);
    snapshot.decision.as_mut().unwrap().attempt = 2;
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(10),
        1,
        TimerTaskKind::DecisionTimeout {
            event_id: EventId(5),
            timeout_kind: TimeoutKind::StartToClose,
            schedule_attempt: 0,
        },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(11));

    fx.processor.process(&task).await.unwrap();
    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    // Nothing happened: the pending decision at attempt 2 is untouched.
    assert_eq!(stored.execution_info.next_event_id, EventId(7));
    assert_eq!(stored.decision.unwrap().attempt, 2);
}

#[tokio::test]
async fn workflow_timeout_closes_and_schedules_history_deletion() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("wf-timeout");
    let run_id = RunId::generate();

    let snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(3600),
        1,
        TimerTaskKind::WorkflowTimeout,
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(3601));

    fx.processor.process(&task).await.unwrap();

    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    assert_eq!(stored.execution_info.close_status, CloseStatus::TimedOut);
    let events = fx.decoded_history(&workflow_id, run_id);
    assert_matches!(&events[0].attributes, EventAttributes::WorkflowExecutionTimedOut);
    assert!(fx
        .store
        .timer_tasks()
        .iter()
        .any(|t| matches!(t.kind, TimerTaskKind::DeleteHistory)));
}

#[tokio::test]
async fn workflow_timeout_with_superseded_version_is_dropped() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("wf-timeout-stale");
    let run_id = RunId::generate();

    // The run failed over: its start version moved past the task's.
    let snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 11);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(3600),
        1,
        TimerTaskKind::WorkflowTimeout,
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(3601));

    fx.processor.process(&task).await.unwrap();
    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    assert_eq!(stored.execution_info.close_status, CloseStatus::Open);
    // Acked without work.
    assert!(fx.store.timer_tasks().is_empty());
}

#[tokio::test]
async fn activity_retry_dispatches_to_matching_outside_the_lock() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("retry-dispatch-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_activity(
        &mut snapshot,
        5,
        at(0),
        None,
        Duration::from_secs(50),
        None,
        timer_task_status::NONE,
        1,
    );
    snapshot.activities.get_mut(&EventId(5)).unwrap().attempt = 1;
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(55),
        1,
        TimerTaskKind::ActivityRetry {
            event_id: EventId(5),
            schedule_attempt: 1,
        },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(56));

    // First matching call fails transiently; the retryable client absorbs
    // it.
    fx.matching.fail_next(1);
    fx.processor.process(&task).await.unwrap();

    let requests = fx.matching.activity_tasks();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].schedule_id, EventId(5));
    assert_eq!(requests[0].domain_id, fx.domain_id);
    assert_eq!(requests[0].task_list, "orders");
}

#[tokio::test]
async fn stale_activity_retry_attempt_is_dropped() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("retry-stale-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_activity(
        &mut snapshot,
        5,
        at(0),
        None,
        Duration::from_secs(50),
        None,
        timer_task_status::NONE,
        1,
    );
    snapshot.activities.get_mut(&EventId(5)).unwrap().attempt = 3;
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(55),
        1,
        TimerTaskKind::ActivityRetry {
            event_id: EventId(5),
            schedule_attempt: 1,
        },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(56));

    fx.processor.process(&task).await.unwrap();
    assert!(fx.matching.activity_tasks().is_empty());
}

#[tokio::test]
async fn shard_stolen_mid_commit_stops_the_processor() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("stolen-shard-wf");
    let run_id = RunId::generate();

    let snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(3600),
        1,
        TimerTaskKind::WorkflowTimeout,
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;

    // The task is not yet due, so the poll loop only arms its gate; the
    // commit attempt below runs against a stolen lease.
    let handle = fx.processor.start();
    fx.store.steal_shard();
    let err = fx.processor.process(&task).await.unwrap_err();
    assert_matches!(err, ProcessError::Store(StoreError::ShardOwnershipLost));
    // Not MaxAttemptsExceeded: fencing failures abort immediately, and the
    // processor transitions out of Running so no further reads happen.
    assert!(!fx.processor.is_running());
    // The task is left unacked.
    assert_eq!(fx.store.timer_tasks().len(), 1);
    handle.stop().await;
}

#[tokio::test]
async fn over_limit_buffer_force_fails_the_inflight_decision() {
    let mut config = history::config::HistoryConfig::default();
    config.buffered_events_limit = 2;
    let fx = fixture_with_config(config).await;
    let workflow_id = WorkflowId::from("stuck-buffer-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_decision(&mut snapshot, 5, 6, 1);
    pending_user_timer(&mut snapshot, "t1", 4, at(100), 1, true);
    snapshot.buffered_batches.insert(
        EventId(20),
        BufferedReplicationBatch {
            first_event_id: EventId(20),
            next_event_id: EventId(23),
            version: FailoverVersion(1),
            events: (20..23).map(|id| timer_started_event(id, at(0), 1)).collect(),
            new_run_events: None,
        },
    );
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(100),
        1,
        TimerTaskKind::UserTimer { event_id: EventId(4) },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(101));

    let err = fx.processor.process(&task).await.unwrap_err();
    assert_matches!(
        err,
        ProcessError::Store(StoreError::BufferedEventsLimitExceeded)
    );

    // The unblock protocol force-failed the in-flight decision and
    // scheduled a replacement.
    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    let events = fx.decoded_history(&workflow_id, run_id);
    assert_matches!(
        &events[0].attributes,
        EventAttributes::DecisionTaskFailed { scheduled_event_id, .. }
            if *scheduled_event_id == EventId(5)
    );
    let decision = stored.decision.expect("replacement decision");
    assert_eq!(decision.attempt, 1);
    // The original timer task stays unacked for a later cycle.
    assert!(fx
        .store
        .timer_tasks()
        .iter()
        .any(|t| t.task_id == task.task_id));
}

#[tokio::test]
async fn release_with_error_invalidates_cached_state() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("cache-invalidate-wf");
    let run_id = RunId::generate();
    fx.seed_execution(fx.running_snapshot(&workflow_id, run_id, 7, 1), Vec::new())
        .await;

    let mut guard = fx
        .cache
        .get_or_create(fx.domain_id, &workflow_id, Some(run_id))
        .await
        .unwrap();
    let state = guard.load().await.unwrap();
    // Mutate in memory without committing.
    state.add_timeout_workflow_event(at(1));
    assert!(!state.is_running());
    let failed: Result<(), StoreError> = Err(StoreError::Internal("boom".to_string()));
    guard.finish(&failed);

    // The next holder sees the persisted (running) state, not the
    // abandoned mutation.
    let mut guard = fx
        .cache
        .get_or_create(fx.domain_id, &workflow_id, Some(run_id))
        .await
        .unwrap();
    let state = guard.load().await.unwrap();
    assert!(state.is_running());
    assert_eq!(state.next_event_id(), EventId(7));
}

#[tokio::test]
async fn started_processor_drains_due_timers_from_the_store() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("live-drain-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_user_timer(&mut snapshot, "t1", 5, at(0), 1, true);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(0),
        1,
        TimerTaskKind::UserTimer { event_id: EventId(5) },
    );
    fx.seed_execution(snapshot, vec![task.clone()]).await;
    fx.clock.advance(Duration::from_secs(1));

    let handle = fx.processor.start();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if fx
            .store
            .timer_tasks()
            .iter()
            .all(|t| t.task_id != task.task_id)
        {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "task was never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;
    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    assert!(stored.user_timers.is_empty());
}
