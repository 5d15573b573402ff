//! Persisted task records produced by history commits: timer tasks drive
//! the timer queue processors, transfer tasks feed the (external) transfer
//! processor and matching dispatch.

use crate::events::TimeoutKind;
use crate::{DomainId, EventId, FailoverVersion, RunId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use strum::IntoStaticStr;

/// Total order of the timer queue: visibility timestamp first, shard task
/// id as the tie breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub visibility_timestamp: DateTime<Utc>,
    pub task_id: TaskId,
}

impl TimerKey {
    #[must_use]
    pub fn new(visibility_timestamp: DateTime<Utc>, task_id: TaskId) -> Self {
        Self {
            visibility_timestamp,
            task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum TimerTaskKind {
    UserTimer {
        event_id: EventId,
    },
    ActivityTimeout {
        event_id: EventId,
        timeout_kind: TimeoutKind,
        schedule_attempt: u32,
    },
    DecisionTimeout {
        event_id: EventId,
        timeout_kind: TimeoutKind,
        schedule_attempt: u32,
    },
    WorkflowTimeout,
    ActivityRetry {
        event_id: EventId,
        schedule_attempt: u32,
    },
    DeleteHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTask {
    pub task_id: TaskId,
    pub visibility_timestamp: DateTime<Utc>,
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub version: FailoverVersion,
    pub kind: TimerTaskKind,
}

impl TimerTask {
    #[must_use]
    pub fn key(&self) -> TimerKey {
        TimerKey::new(self.visibility_timestamp, self.task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum TransferTaskKind {
    Decision {
        schedule_id: EventId,
        task_list: String,
    },
    Activity {
        schedule_id: EventId,
        task_list: String,
        target_domain_id: DomainId,
    },
    CloseExecution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub task_id: TaskId,
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub version: FailoverVersion,
    pub kind: TransferTaskKind,
}
