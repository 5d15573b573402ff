//! In-memory storage backends for tests and single-process runs.
//!
//! One [`InMemoryStore`] models one shard: execution records with
//! next-event-id compare-and-swap, an append-only events table with the
//! same conditional semantics as the production backend, a timer task
//! index ordered by [`TimerKey`], and the shard metadata record whose
//! `range_id` fences every write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::cluster::{ClusterName, DomainEntry, DomainRegistry};
use concepts::events::HistoryPageToken;
use concepts::storage::{
    AddActivityTaskRequest, AddDecisionTaskRequest, AppendHistoryEventsRequest,
    CreateMode, CreateWorkflowExecutionRequest, CurrentExecution, ExecutionStore, HistoryStore,
    MatchingClient, MatchingError, ReadHistoryRequest, ReadHistoryResponse,
    ResetWorkflowExecutionRequest, ShardRecord, ShardStore, StoreError, TimerTaskPage,
    UpdateWorkflowExecutionRequest,
};
use concepts::tasks::{TimerKey, TimerTask, TransferTask};
use concepts::{DomainId, EventId, RunId, TaskId, WorkflowExecution, WorkflowId};
use concepts::events::EncodedEventBatch;
use concepts::execution::WorkflowSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};

type ExecutionKey = (DomainId, WorkflowId, RunId);
type HistoryRowKey = (DomainId, WorkflowId, RunId, EventId);

#[derive(Debug, Clone)]
struct HistoryRow {
    batch: EncodedEventBatch,
    event_batch_version: concepts::FailoverVersion,
    range_id: i64,
    transaction_id: i64,
}

#[derive(Debug)]
struct Inner {
    shard: ShardRecord,
    executions: HashMap<ExecutionKey, WorkflowSnapshot>,
    current_runs: HashMap<(DomainId, WorkflowId), RunId>,
    history: BTreeMap<HistoryRowKey, HistoryRow>,
    timer_tasks: BTreeMap<TimerKey, TimerTask>,
    transfer_tasks: Vec<TransferTask>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(shard_id: u32) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            inner: Mutex::new(Inner {
                shard: ShardRecord {
                    shard_id,
                    range_id: 1,
                    timer_ack_level: TimerKey::new(epoch, TaskId(0)),
                    failover_ack_levels: HashMap::new(),
                    cluster_times: HashMap::new(),
                },
                executions: HashMap::new(),
                current_runs: HashMap::new(),
                history: BTreeMap::new(),
                timer_tasks: BTreeMap::new(),
                transfer_tasks: Vec::new(),
            }),
        }
    }

    /// Simulate another process taking over the shard lease.
    pub fn steal_shard(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shard.range_id += 1;
    }

    pub fn timer_tasks(&self) -> Vec<TimerTask> {
        self.inner.lock().unwrap().timer_tasks.values().cloned().collect()
    }

    pub fn transfer_tasks(&self) -> Vec<TransferTask> {
        self.inner.lock().unwrap().transfer_tasks.clone()
    }

    pub fn current_shard_record(&self) -> ShardRecord {
        self.inner.lock().unwrap().shard.clone()
    }

    pub fn history_batches(
        &self,
        domain_id: &DomainId,
        execution: &WorkflowExecution,
    ) -> Vec<EncodedEventBatch> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .range(history_range(domain_id, execution, EventId::FIRST, EventId(i64::MAX)))
            .map(|(_, row)| row.batch.clone())
            .collect()
    }

    fn check_range(inner: &Inner, range_id: i64) -> Result<(), StoreError> {
        if range_id != inner.shard.range_id {
            return Err(StoreError::ShardOwnershipLost);
        }
        Ok(())
    }

    fn insert_tasks(inner: &mut Inner, timer_tasks: Vec<TimerTask>, transfer_tasks: Vec<TransferTask>) {
        for task in timer_tasks {
            inner.timer_tasks.insert(task.key(), task);
        }
        inner.transfer_tasks.extend(transfer_tasks);
    }
}

fn history_range(
    domain_id: &DomainId,
    execution: &WorkflowExecution,
    first: EventId,
    next: EventId,
) -> (Bound<HistoryRowKey>, Bound<HistoryRowKey>) {
    (
        Bound::Included((
            *domain_id,
            execution.workflow_id.clone(),
            execution.run_id,
            first,
        )),
        Bound::Excluded((
            *domain_id,
            execution.workflow_id.clone(),
            execution.run_id,
            next,
        )),
    )
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn append_history_events(
        &self,
        request: AppendHistoryEventsRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (
            request.domain_id,
            request.execution.workflow_id.clone(),
            request.execution.run_id,
            request.first_event_id,
        );
        let row = HistoryRow {
            batch: request.events,
            event_batch_version: request.event_batch_version,
            range_id: request.range_id,
            transaction_id: request.transaction_id,
        };
        match inner.history.get(&key) {
            None => {
                inner.history.insert(key, row);
                Ok(())
            }
            Some(existing) if request.overwrite => {
                if existing.range_id <= request.range_id
                    && existing.transaction_id < request.transaction_id
                {
                    inner.history.insert(key, row);
                    Ok(())
                } else {
                    Err(StoreError::Conflict)
                }
            }
            Some(_) => Err(StoreError::Conflict),
        }
    }

    async fn read_history(
        &self,
        request: ReadHistoryRequest,
    ) -> Result<ReadHistoryResponse, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut token = HistoryPageToken::decode(request.page_token.as_deref())?;
        let resume_from: EventId = if token.cursor.is_empty() {
            request.first_event_id
        } else {
            serde_json::from_slice(&token.cursor)
                .map_err(|err| StoreError::Internal(err.to_string()))?
        };
        let first_page = request.page_token.is_none();

        let mut batches = Vec::new();
        let mut next_cursor = None;
        for ((_, _, _, first_event_id), row) in inner.history.range(history_range(
            &request.domain_id,
            &request.execution,
            resume_from,
            request.next_event_id,
        )) {
            if batches.len() == request.page_size {
                next_cursor = Some(*first_event_id);
                break;
            }
            // Skip batches rewound to an older version by a conflict reset.
            if let Some(last) = token.last_event_batch_version {
                if row.event_batch_version < last {
                    continue;
                }
            }
            token.last_event_batch_version = Some(row.event_batch_version);
            batches.push(row.batch.clone());
        }

        if batches.is_empty() && first_page {
            return Err(StoreError::NotFound);
        }

        let next_page_token = match next_cursor {
            Some(cursor) => {
                token.cursor =
                    serde_json::to_vec(&cursor).map_err(|err| StoreError::Internal(err.to_string()))?;
                token.encode()?
            }
            None => None,
        };
        Ok(ReadHistoryResponse {
            batches,
            next_page_token,
        })
    }

    async fn delete_history(
        &self,
        domain_id: &DomainId,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<HistoryRowKey> = inner
            .history
            .range(history_range(domain_id, execution, EventId::FIRST, EventId(i64::MAX)))
            .map(|(key, _)| key.clone())
            .collect();
        debug!(%execution, "Deleting {} history rows", keys.len());
        for key in keys {
            inner.history.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_range(&inner, request.range_id)?;

        let info = &request.snapshot.execution_info;
        let domain_id = info.domain_id;
        let workflow_id = info.workflow_id.clone();
        let run_id = info.run_id;

        if let Some(current_run_id) = inner.current_runs.get(&(domain_id, workflow_id.clone())) {
            let allowed = request.mode == CreateMode::WithPreviousRunId
                && request.previous_run_id == Some(*current_run_id);
            if !allowed {
                let current = inner
                    .executions
                    .get(&(domain_id, workflow_id.clone(), *current_run_id))
                    .ok_or_else(|| {
                        StoreError::Internal("current run pointer without record".to_string())
                    })?;
                return Err(StoreError::AlreadyStarted {
                    current_run_id: *current_run_id,
                    state: current.execution_info.state,
                    close_status: current.execution_info.close_status,
                    start_version: current.replication_state.start_version,
                    request_id: current.execution_info.create_request_id,
                });
            }
        } else if request.mode == CreateMode::WithPreviousRunId {
            return Err(StoreError::NotFound);
        }

        trace!(%workflow_id, %run_id, "Creating workflow execution record");
        inner
            .current_runs
            .insert((domain_id, workflow_id.clone()), run_id);
        inner
            .executions
            .insert((domain_id, workflow_id, run_id), request.snapshot);
        Self::insert_tasks(&mut inner, request.timer_tasks, request.transfer_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> Result<WorkflowSnapshot, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .executions
            .get(&(*domain_id, workflow_id.clone(), *run_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_current_execution(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
    ) -> Result<CurrentExecution, StoreError> {
        let inner = self.inner.lock().unwrap();
        let run_id = inner
            .current_runs
            .get(&(*domain_id, workflow_id.clone()))
            .ok_or(StoreError::NotFound)?;
        let snapshot = inner
            .executions
            .get(&(*domain_id, workflow_id.clone(), *run_id))
            .ok_or(StoreError::NotFound)?;
        Ok(CurrentExecution {
            run_id: *run_id,
            state: snapshot.execution_info.state,
            close_status: snapshot.execution_info.close_status,
            start_version: snapshot.replication_state.start_version,
            last_write_version: snapshot.replication_state.last_write_version,
            create_request_id: snapshot.execution_info.create_request_id,
        })
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_range(&inner, request.range_id)?;

        let info = &request.snapshot.execution_info;
        let key = (info.domain_id, info.workflow_id.clone(), info.run_id);
        let stored = inner.executions.get(&key).ok_or(StoreError::NotFound)?;
        if stored.execution_info.next_event_id != request.condition {
            debug!(
                %info.run_id,
                stored = %stored.execution_info.next_event_id,
                condition = %request.condition,
                "Conditional update failed"
            );
            return Err(StoreError::Conflict);
        }
        inner.executions.insert(key, request.snapshot);
        Self::insert_tasks(&mut inner, request.timer_tasks, request.transfer_tasks);
        Ok(())
    }

    async fn reset_workflow_execution(
        &self,
        request: ResetWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_range(&inner, request.range_id)?;
        let info = &request.snapshot.execution_info;
        let key = (info.domain_id, info.workflow_id.clone(), info.run_id);
        inner
            .current_runs
            .insert((info.domain_id, info.workflow_id.clone()), info.run_id);
        inner.executions.insert(key, request.snapshot);
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .executions
            .remove(&(*domain_id, workflow_id.clone(), *run_id));
        if inner.current_runs.get(&(*domain_id, workflow_id.clone())) == Some(run_id) {
            inner.current_runs.remove(&(*domain_id, workflow_id.clone()));
        }
        Ok(())
    }

    async fn get_timer_tasks(
        &self,
        read_level: TimerKey,
        batch_size: usize,
    ) -> Result<TimerTaskPage, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<TimerTask> = Vec::with_capacity(batch_size);
        let mut more_available = false;
        for (_, task) in inner
            .timer_tasks
            .range((Bound::Excluded(read_level), Bound::Unbounded))
        {
            if tasks.len() == batch_size {
                more_available = true;
                break;
            }
            tasks.push(task.clone());
        }
        Ok(TimerTaskPage {
            tasks,
            more_available,
        })
    }

    async fn complete_timer_task(&self, key: TimerKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.timer_tasks.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl ShardStore for InMemoryStore {
    async fn get_shard(&self) -> Result<ShardRecord, StoreError> {
        Ok(self.inner.lock().unwrap().shard.clone())
    }

    async fn update_shard(
        &self,
        record: ShardRecord,
        expected_range_id: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shard.range_id != expected_range_id {
            return Err(StoreError::ShardOwnershipLost);
        }
        inner.shard = record;
        Ok(())
    }
}

/// Fixed domain table backing the registry contract in tests.
#[derive(Default)]
pub struct InMemoryDomainRegistry {
    entries: Mutex<Vec<DomainEntry>>,
}

impl InMemoryDomainRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: DomainEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn set_active_cluster(&self, id: &DomainId, cluster: ClusterName) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == *id) {
            entry.active_cluster = cluster;
        }
    }
}

impl DomainRegistry for InMemoryDomainRegistry {
    fn entry_by_id(&self, id: &DomainId) -> Option<DomainEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.id == *id)
            .cloned()
    }

    fn entry_by_name(&self, name: &str) -> Option<DomainEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
    }
}

/// Matching-service double: records every dispatch, optionally failing the
/// first N calls to exercise retry paths.
#[derive(Default)]
pub struct RecordingMatchingClient {
    activity_tasks: Mutex<Vec<AddActivityTaskRequest>>,
    decision_tasks: Mutex<Vec<AddDecisionTaskRequest>>,
    fail_next: AtomicUsize,
}

impl RecordingMatchingClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        self.fail_next.store(times, Ordering::SeqCst);
    }

    pub fn activity_tasks(&self) -> Vec<AddActivityTaskRequest> {
        self.activity_tasks.lock().unwrap().clone()
    }

    pub fn decision_tasks(&self) -> Vec<AddDecisionTaskRequest> {
        self.decision_tasks.lock().unwrap().clone()
    }

    fn maybe_fail(&self) -> Result<(), MatchingError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(MatchingError::ServiceBusy);
        }
        Ok(())
    }
}

#[async_trait]
impl MatchingClient for RecordingMatchingClient {
    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> Result<(), MatchingError> {
        self.maybe_fail()?;
        self.activity_tasks.lock().unwrap().push(request);
        Ok(())
    }

    async fn add_decision_task(&self, request: AddDecisionTaskRequest) -> Result<(), MatchingError> {
        self.maybe_fail()?;
        self.decision_tasks.lock().unwrap().push(request);
        Ok(())
    }
}
