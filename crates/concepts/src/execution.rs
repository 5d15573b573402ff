//! Persisted shape of a workflow run's mutable state: control metadata,
//! replication watermarks and the pending activity/timer/decision records
//! the timer processors act on.

use crate::cluster::ClusterName;
use crate::events::{HistoryEvent, ParentExecutionInfo, RetryPolicy};
use crate::{DomainId, EventId, FailoverVersion, RequestId, RunId, WorkflowId};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CloseStatus {
    Open,
    Completed,
    Failed,
    TimedOut,
    Terminated,
    ContinuedAsNew,
}

/// Bits recording which timeout timer tasks already exist for an activity,
/// so repeated passes do not persist duplicates.
pub mod timer_task_status {
    pub const NONE: u32 = 0;
    pub const CREATED_START_TO_CLOSE: u32 = 1;
    pub const CREATED_SCHEDULE_TO_START: u32 = 1 << 1;
    pub const CREATED_SCHEDULE_TO_CLOSE: u32 = 1 << 2;
    pub const CREATED_HEARTBEAT: u32 = 1 << 3;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionInfo {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub parent: Option<ParentExecutionInfo>,
    pub workflow_type: String,
    pub task_list: String,
    pub sticky_task_list: Option<String>,
    pub sticky_schedule_to_start_timeout: Duration,
    pub execution_timeout: Duration,
    pub decision_timeout: Duration,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub next_event_id: EventId,
    /// First event id of the most recently appended batch.
    pub last_first_event_id: EventId,
    pub last_processed_event_id: EventId,
    pub start_timestamp: DateTime<Utc>,
    pub continued_run_id: Option<RunId>,
    pub create_request_id: RequestId,
}

impl ExecutionInfo {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkflowState::Created | WorkflowState::Running)
    }
}

/// Per-remote-cluster watermark of what has been applied from that cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationInfo {
    pub version: FailoverVersion,
    pub last_event_id: EventId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationState {
    pub current_version: FailoverVersion,
    pub start_version: FailoverVersion,
    pub last_write_version: FailoverVersion,
    pub last_write_event_id: EventId,
    pub last_replication_info: HashMap<ClusterName, ReplicationInfo>,
}

impl ReplicationState {
    #[must_use]
    pub fn new(version: FailoverVersion) -> Self {
        Self {
            current_version: version,
            start_version: version,
            last_write_version: version,
            last_write_event_id: EventId::EMPTY,
            last_replication_info: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityInfo {
    pub version: FailoverVersion,
    pub schedule_id: EventId,
    pub scheduled_time: DateTime<Utc>,
    pub started_id: EventId,
    pub started_time: DateTime<Utc>,
    pub activity_id: String,
    pub task_list: String,
    /// Target domain name for cross-domain activities.
    pub domain: Option<String>,
    pub schedule_to_close_timeout: Duration,
    pub schedule_to_start_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub last_heartbeat_time: DateTime<Utc>,
    pub details: Option<Vec<u8>>,
    pub attempt: u32,
    pub retry_policy: Option<RetryPolicy>,
    pub retry_expiration_time: Option<DateTime<Utc>>,
    pub timer_task_status: u32,
    /// Second-resolution visibility of the last created timeout timer, used
    /// to dedupe heartbeat timer creation.
    pub last_timeout_visibility: i64,
}

impl ActivityInfo {
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started_id.is_set()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimerInfo {
    pub version: FailoverVersion,
    pub timer_id: String,
    pub started_id: EventId,
    pub expiry: DateTime<Utc>,
    pub task_created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionInfo {
    pub version: FailoverVersion,
    pub schedule_id: EventId,
    pub started_id: EventId,
    pub request_id: Option<RequestId>,
    pub start_to_close_timeout: Duration,
    pub attempt: u32,
    pub scheduled_time: DateTime<Utc>,
    pub started_time: Option<DateTime<Utc>>,
}

impl DecisionInfo {
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started_id.is_set()
    }
}

/// An out-of-order remote event batch parked until the run's next event id
/// catches up with `first_event_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedReplicationBatch {
    pub first_event_id: EventId,
    pub next_event_id: EventId,
    pub version: FailoverVersion,
    pub events: Vec<HistoryEvent>,
    pub new_run_events: Option<Vec<HistoryEvent>>,
}

/// Complete persisted mutable state of one run; the unit of the execution
/// store's compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    pub execution_info: ExecutionInfo,
    pub replication_state: ReplicationState,
    pub activities: HashMap<EventId, ActivityInfo>,
    pub user_timers: HashMap<String, TimerInfo>,
    pub decision: Option<DecisionInfo>,
    pub buffered_batches: BTreeMap<EventId, BufferedReplicationBatch>,
}

impl WorkflowSnapshot {
    #[must_use]
    pub fn buffered_event_count(&self) -> usize {
        self.buffered_batches
            .values()
            .map(|batch| batch.events.len())
            .sum()
    }
}
