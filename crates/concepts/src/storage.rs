//! Storage and matching contracts. Backends implement these traits; the
//! history core only ever talks through them.
//!
//! The execution store must offer compare-and-swap on the stored
//! `next_event_id`, fenced by the shard range token: a lost range token
//! means another process owns the shard and every mutation must fail with
//! [`StoreError::ShardOwnershipLost`].

use crate::cluster::ClusterName;
use crate::events::{EncodedEventBatch, HistoryCodecError};
use crate::execution::{CloseStatus, WorkflowSnapshot, WorkflowState};
use crate::tasks::{TimerKey, TimerTask, TransferTask};
use crate::{DomainId, EventId, FailoverVersion, RequestId, RunId, WorkflowExecution, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Failure taxonomy of the persistence boundary. Sentinels are variants,
/// never strings; callers branch on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("entity not found")]
    NotFound,
    /// Conditional write lost the race; reload and retry.
    #[error("condition failed")]
    Conflict,
    #[error("workflow already started, current run {current_run_id}")]
    AlreadyStarted {
        current_run_id: RunId,
        state: WorkflowState,
        close_status: CloseStatus,
        start_version: FailoverVersion,
        request_id: RequestId,
    },
    /// The shard range token moved on; this process no longer owns the
    /// shard and must halt all pending work.
    #[error("shard ownership lost")]
    ShardOwnershipLost,
    #[error("buffered events limit exceeded")]
    BufferedEventsLimitExceeded,
    #[error("service busy")]
    ServiceBusy,
    /// Outcome unknown: the write may or may not have been applied.
    #[error("operation timed out")]
    Timeout,
    #[error("internal: {0}")]
    Internal(String),
}

impl From<HistoryCodecError> for StoreError {
    fn from(err: HistoryCodecError) -> Self {
        StoreError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AppendHistoryEventsRequest {
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub first_event_id: EventId,
    pub event_batch_version: FailoverVersion,
    pub range_id: i64,
    pub transaction_id: i64,
    pub events: EncodedEventBatch,
    /// Non-overwrite is insert-if-absent. Overwrite replaces an existing
    /// row only when the stored row's `range_id` is at most ours and its
    /// `transaction_id` is below ours.
    pub overwrite: bool,
}

#[derive(Debug, Clone)]
pub struct ReadHistoryRequest {
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub first_event_id: EventId,
    pub next_event_id: EventId,
    pub page_size: usize,
    pub page_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ReadHistoryResponse {
    pub batches: Vec<EncodedEventBatch>,
    pub next_page_token: Option<Vec<u8>>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// CAS on (domain, workflow, run, first_event_id).
    async fn append_history_events(
        &self,
        request: AppendHistoryEventsRequest,
    ) -> Result<(), StoreError>;

    /// Paged read of `[first_event_id, next_event_id)`. Only batches with a
    /// version at or above the token's last-seen batch version are
    /// returned, excluding stale rewound batches. An empty first page is
    /// [`StoreError::NotFound`].
    async fn read_history(
        &self,
        request: ReadHistoryRequest,
    ) -> Result<ReadHistoryResponse, StoreError>;

    async fn delete_history(
        &self,
        domain_id: &DomainId,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    BrandNew,
    /// Continue-as-new or post-terminate create: replaces the current-run
    /// pointer that still names `previous_run_id`.
    WithPreviousRunId,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    pub snapshot: WorkflowSnapshot,
    pub range_id: i64,
    pub mode: CreateMode,
    pub previous_run_id: Option<RunId>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    pub snapshot: WorkflowSnapshot,
    /// Expected stored `next_event_id`; mismatch is [`StoreError::Conflict`].
    pub condition: EventId,
    pub range_id: i64,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

#[derive(Debug, Clone)]
pub struct ResetWorkflowExecutionRequest {
    pub snapshot: WorkflowSnapshot,
    pub range_id: i64,
}

/// Summary of the current run for a workflow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentExecution {
    pub run_id: RunId,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub start_version: FailoverVersion,
    pub last_write_version: FailoverVersion,
    pub create_request_id: RequestId,
}

#[derive(Debug, Clone)]
pub struct TimerTaskPage {
    pub tasks: Vec<TimerTask>,
    pub more_available: bool,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    async fn get_workflow_execution(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> Result<WorkflowSnapshot, StoreError>;

    async fn get_current_execution(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
    ) -> Result<CurrentExecution, StoreError>;

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    /// Conflict-resolution replace: installs the rebuilt snapshot without a
    /// next-event-id condition (still range-fenced).
    async fn reset_workflow_execution(
        &self,
        request: ResetWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    async fn delete_workflow_execution(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> Result<(), StoreError>;

    /// Timer tasks strictly after `read_level`, at most `batch_size`.
    async fn get_timer_tasks(
        &self,
        read_level: TimerKey,
        batch_size: usize,
    ) -> Result<TimerTaskPage, StoreError>;

    async fn complete_timer_task(&self, key: TimerKey) -> Result<(), StoreError>;
}

/// Shard metadata record. `range_id` is the fencing token; every update is
/// CAS on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRecord {
    pub shard_id: u32,
    pub range_id: i64,
    pub timer_ack_level: TimerKey,
    pub failover_ack_levels: HashMap<(DomainId, ClusterName), TimerKey>,
    pub cluster_times: HashMap<ClusterName, DateTime<Utc>>,
}

#[async_trait]
pub trait ShardStore: Send + Sync {
    async fn get_shard(&self) -> Result<ShardRecord, StoreError>;

    async fn update_shard(
        &self,
        record: ShardRecord,
        expected_range_id: i64,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchingError {
    #[error("matching service busy")]
    ServiceBusy,
    #[error("matching call timed out")]
    Timeout,
    #[error("entity not found")]
    NotFound,
    #[error("matching internal: {0}")]
    Internal(String),
}

impl MatchingError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, MatchingError::ServiceBusy | MatchingError::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddActivityTaskRequest {
    pub domain_id: DomainId,
    pub source_domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub task_list: String,
    pub schedule_id: EventId,
    pub schedule_to_start_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddDecisionTaskRequest {
    pub domain_id: DomainId,
    pub execution: WorkflowExecution,
    pub task_list: String,
    pub schedule_id: EventId,
}

/// Task-matching service. Both calls are idempotent on
/// (execution, schedule_id).
#[async_trait]
pub trait MatchingClient: Send + Sync {
    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> Result<(), MatchingError>;

    async fn add_decision_task(&self, request: AddDecisionTaskRequest) -> Result<(), MatchingError>;
}
