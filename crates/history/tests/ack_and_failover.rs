//! Ack-manager window semantics and the failover drain lifecycle.

mod common;

use common::*;
use concepts::tasks::{TimerKey, TimerTaskKind};
use concepts::time::TokioSleep;
use concepts::{DomainId, EventId, RunId, TaskId, WorkflowId};
use history::ack_manager::TimerAckManager;
use history::timer_processor::TimerQueueProcessor;
use std::time::Duration;

#[tokio::test]
async fn ack_level_advances_only_through_the_completed_prefix() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("ack-wf");
    let run_id = RunId::generate();
    let tasks: Vec<_> = (1..=3)
        .map(|i| {
            fx.timer_task(
                &workflow_id,
                run_id,
                1000 + i,
                at(i),
                1,
                TimerTaskKind::DeleteHistory,
            )
        })
        .collect();
    fx.seed_execution(
        fx.running_snapshot(&workflow_id, run_id, 5, 1),
        tasks.clone(),
    )
    .await;
    fx.clock.advance(Duration::from_secs(10));

    let ack = TimerAckManager::new_active(fx.shard.clone());
    let batch = ack.read_timer_tasks().await.unwrap();
    assert_eq!(batch.tasks.len(), 3);
    assert!(batch.look_ahead.is_none());
    assert!(!batch.more_available);

    // Completing out of order: the level may not pass the oldest
    // in-flight task.
    ack.complete_timer_task(tasks[1].key()).await.unwrap();
    ack.complete_timer_task(tasks[2].key()).await.unwrap();
    let progress = ack.update_ack_level().await.unwrap();
    assert!(progress.ack_level < tasks[0].key());

    ack.complete_timer_task(tasks[0].key()).await.unwrap();
    let progress = ack.update_ack_level().await.unwrap();
    assert_eq!(progress.ack_level, tasks[2].key());
    // Persisted to shard metadata.
    assert_eq!(fx.shard.timer_ack_level(), tasks[2].key());
    assert_eq!(
        fx.store.current_shard_record().timer_ack_level,
        tasks[2].key()
    );
}

#[tokio::test]
async fn future_task_becomes_the_look_ahead_and_is_not_dispatched() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("lookahead-wf");
    let run_id = RunId::generate();
    let due = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(1),
        1,
        TimerTaskKind::DeleteHistory,
    );
    let future = fx.timer_task(
        &workflow_id,
        run_id,
        1002,
        at(500),
        1,
        TimerTaskKind::DeleteHistory,
    );
    fx.seed_execution(
        fx.running_snapshot(&workflow_id, run_id, 5, 1),
        vec![due.clone(), future.clone()],
    )
    .await;
    fx.clock.advance(Duration::from_secs(10));

    let ack = TimerAckManager::new_active(fx.shard.clone());
    let batch = ack.read_timer_tasks().await.unwrap();
    assert_eq!(batch.tasks.len(), 1);
    assert_eq!(batch.tasks[0].task_id, due.task_id);
    assert_eq!(
        batch.look_ahead.as_ref().map(|t| t.task_id),
        Some(future.task_id)
    );
    assert!(!batch.more_available);

    // The look-ahead was not added to the window: completing the due task
    // drains it and the level lands at the read level, before the future
    // task.
    ack.complete_timer_task(due.key()).await.unwrap();
    let progress = ack.update_ack_level().await.unwrap();
    assert_eq!(progress.ack_level, due.key());
    assert!(progress.ack_level < future.key());
}

#[tokio::test]
async fn failover_manager_stops_at_its_ceiling_and_reports_finished() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("failover-ack-wf");
    let run_id = RunId::generate();
    let in_window = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(5),
        1,
        TimerTaskKind::DeleteHistory,
    );
    let beyond = fx.timer_task(
        &workflow_id,
        run_id,
        1002,
        at(100),
        1,
        TimerTaskKind::DeleteHistory,
    );
    fx.seed_execution(
        fx.running_snapshot(&workflow_id, run_id, 5, 1),
        vec![in_window.clone(), beyond.clone()],
    )
    .await;
    fx.clock.advance(Duration::from_secs(200));

    let ack = TimerAckManager::new_failover(
        fx.shard.clone(),
        fx.domain_id,
        beta(),
        at(0),
        at(50),
    );
    let batch = ack.read_timer_tasks().await.unwrap();
    // Only the task below the ceiling is handed out.
    assert_eq!(batch.tasks.len(), 1);
    assert_eq!(batch.tasks[0].task_id, in_window.task_id);
    assert!(!batch.more_available);

    let progress = ack.update_ack_level().await.unwrap();
    assert!(!progress.finished);

    ack.complete_timer_task(in_window.key()).await.unwrap();
    let progress = ack.update_ack_level().await.unwrap();
    assert!(progress.finished);
    assert_eq!(
        fx.shard.failover_ack_level(&fx.domain_id, &beta()),
        Some(TimerKey::new(at(50), TaskId(0)))
    );
}

#[tokio::test]
async fn failover_processor_only_accepts_its_domain() {
    let fx = fixture().await;
    let workflow_id = WorkflowId::from("failover-filter-wf");
    let run_id = RunId::generate();
    let foreign_domain = DomainId::generate();

    fx.seed_execution(fx.running_snapshot(&workflow_id, run_id, 7, 1), Vec::new())
        .await;
    let mut foreign_task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(0),
        1,
        TimerTaskKind::UserTimer { event_id: EventId(5) },
    );
    foreign_task.domain_id = foreign_domain;

    let processor = TimerQueueProcessor::new_failover(
        fx.shard.clone(),
        fx.cache.clone(),
        fx.matching.clone(),
        TokioSleep,
        fx.domain_id,
        beta(),
        at(0),
        at(100),
    );
    // Foreign-domain task: acked without work, no state change.
    processor.process(&foreign_task).await.unwrap();
    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    assert_eq!(stored.execution_info.next_event_id, EventId(7));
}

#[tokio::test]
async fn failover_drain_self_terminates() {
    let mut config = history::config::HistoryConfig::default();
    config.timer_update_ack_interval = Duration::from_millis(20);
    let fx = fixture_with_config(config).await;
    let workflow_id = WorkflowId::from("failover-drain-wf");
    let run_id = RunId::generate();

    let mut snapshot = fx.running_snapshot(&workflow_id, run_id, 7, 1);
    pending_user_timer(&mut snapshot, "t1", 5, at(10), 1, true);
    let task = fx.timer_task(
        &workflow_id,
        run_id,
        1001,
        at(10),
        1,
        TimerTaskKind::UserTimer { event_id: EventId(5) },
    );
    fx.seed_execution(snapshot, vec![task]).await;
    fx.clock.advance(Duration::from_secs(60));

    let processor = TimerQueueProcessor::new_failover(
        fx.shard.clone(),
        fx.cache.clone(),
        fx.matching.clone(),
        TokioSleep,
        fx.domain_id,
        beta(),
        at(0),
        at(30),
    );
    let handle = processor.start();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while processor.is_running() {
        assert!(
            std::time::Instant::now() < deadline,
            "failover processor never drained"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;
    // The timer inside the window fired before self-termination.
    let stored = fx.snapshot_of(&workflow_id, run_id).await;
    assert!(stored.user_timers.is_empty());
}
