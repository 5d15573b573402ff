//! Shared fixture: one shard backed by the in-memory store, with a global
//! domain replicated between clusters `alpha` (initial version 1, local)
//! and `beta` (initial version 2), failover increment 10.

// Not every test binary uses every helper.
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use concepts::cluster::{ClusterMetadata, ClusterName, DomainEntry, DomainRegistry};
use concepts::events::{EventAttributes, HistoryEvent, RetryPolicy};
use concepts::execution::{
    ActivityInfo, CloseStatus, DecisionInfo, ExecutionInfo, ReplicationState, TimerInfo,
    WorkflowSnapshot, WorkflowState,
};
use concepts::storage::{
    CreateMode, CreateWorkflowExecutionRequest, ExecutionStore, HistoryStore, ShardStore,
};
use concepts::tasks::{TimerTask, TimerTaskKind};
use concepts::time::TokioSleep;
use concepts::{
    DomainId, EventId, FailoverVersion, RequestId, RunId, TaskId, WorkflowExecution, WorkflowId,
};
use db_mem::{InMemoryDomainRegistry, InMemoryStore, RecordingMatchingClient};
use history::cache::ExecutionCache;
use history::config::HistoryConfig;
use history::replicator::{HistoryReplicator, NoopNotifier};
use history::shard::ShardContext;
use history::timer_processor::TimerQueueProcessor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use test_utils::sim_clock::SimClock;

pub const EPOCH_SECS: i64 = 1_700_000_000;

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(EPOCH_SECS + offset_secs, 0).unwrap()
}

pub fn alpha() -> ClusterName {
    ClusterName::from("alpha")
}

pub fn beta() -> ClusterName {
    ClusterName::from("beta")
}

pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub registry: Arc<InMemoryDomainRegistry>,
    pub shard: Arc<ShardContext<SimClock>>,
    pub cache: Arc<ExecutionCache<SimClock>>,
    pub matching: Arc<RecordingMatchingClient>,
    pub processor: Arc<TimerQueueProcessor<SimClock, TokioSleep>>,
    pub replicator: HistoryReplicator<SimClock>,
    pub clock: SimClock,
    pub domain_id: DomainId,
}

pub async fn fixture() -> Fixture {
    fixture_with_config(HistoryConfig::default()).await
}

pub async fn fixture_with_config(config: HistoryConfig) -> Fixture {
    test_utils::set_up();
    let clock = SimClock::new(at(0));
    let store = Arc::new(InMemoryStore::new(1));
    let registry = Arc::new(InMemoryDomainRegistry::new());
    let domain_id = DomainId::generate();
    registry.register(DomainEntry {
        id: domain_id,
        name: "orders-domain".to_string(),
        is_global: true,
        active_cluster: alpha(),
        clusters: vec![alpha(), beta()],
        failover_version: FailoverVersion(1),
    });
    let metadata = ClusterMetadata::new(alpha(), 10, [(alpha(), 1), (beta(), 2)]);

    let shard = ShardContext::acquire(
        Arc::new(config),
        clock.clone(),
        store.clone() as Arc<dyn ExecutionStore>,
        store.clone() as Arc<dyn HistoryStore>,
        store.clone() as Arc<dyn ShardStore>,
        Arc::new(metadata),
        registry.clone() as Arc<dyn DomainRegistry>,
    )
    .await
    .unwrap();
    let cache = Arc::new(ExecutionCache::new(shard.clone()));
    let matching = Arc::new(RecordingMatchingClient::new());
    let processor = TimerQueueProcessor::new_active(
        shard.clone(),
        cache.clone(),
        matching.clone(),
        TokioSleep,
    );
    let replicator =
        HistoryReplicator::new(shard.clone(), cache.clone(), Arc::new(NoopNotifier));
    Fixture {
        store,
        registry,
        shard,
        cache,
        matching,
        processor,
        replicator,
        clock,
        domain_id,
    }
}

impl Fixture {
    /// A running execution snapshot with `next_event_id` and every write
    /// watermark at `version`.
    pub fn running_snapshot(
        &self,
        workflow_id: &WorkflowId,
        run_id: RunId,
        next_event_id: i64,
        version: i64,
    ) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution_info: ExecutionInfo {
                domain_id: self.domain_id,
                workflow_id: workflow_id.clone(),
                run_id,
                parent: None,
                workflow_type: "order".to_string(),
                task_list: "orders".to_string(),
                sticky_task_list: None,
                sticky_schedule_to_start_timeout: Duration::ZERO,
                execution_timeout: Duration::from_secs(3600),
                decision_timeout: Duration::from_secs(10),
                state: WorkflowState::Running,
                close_status: CloseStatus::Open,
                next_event_id: EventId(next_event_id),
                last_first_event_id: EventId::FIRST,
                last_processed_event_id: EventId::EMPTY,
                start_timestamp: at(0),
                continued_run_id: None,
                create_request_id: RequestId::generate(),
            },
            replication_state: ReplicationState {
                current_version: FailoverVersion(version),
                start_version: FailoverVersion(version),
                last_write_version: FailoverVersion(version),
                last_write_event_id: EventId(next_event_id - 1),
                last_replication_info: hashbrown::HashMap::new(),
            },
            activities: hashbrown::HashMap::new(),
            user_timers: hashbrown::HashMap::new(),
            decision: None,
            buffered_batches: BTreeMap::new(),
        }
    }

    pub async fn seed_execution(&self, snapshot: WorkflowSnapshot, timer_tasks: Vec<TimerTask>) {
        self.store
            .create_workflow_execution(CreateWorkflowExecutionRequest {
                snapshot,
                range_id: 1,
                mode: CreateMode::BrandNew,
                previous_run_id: None,
                transfer_tasks: Vec::new(),
                timer_tasks,
            })
            .await
            .unwrap();
    }

    pub fn timer_task(
        &self,
        workflow_id: &WorkflowId,
        run_id: RunId,
        task_id: i64,
        visibility: DateTime<Utc>,
        version: i64,
        kind: TimerTaskKind,
    ) -> TimerTask {
        TimerTask {
            task_id: TaskId(task_id),
            visibility_timestamp: visibility,
            domain_id: self.domain_id,
            workflow_id: workflow_id.clone(),
            run_id,
            version: FailoverVersion(version),
            kind,
        }
    }

    pub async fn snapshot_of(&self, workflow_id: &WorkflowId, run_id: RunId) -> WorkflowSnapshot {
        self.store
            .get_workflow_execution(&self.domain_id, workflow_id, &run_id)
            .await
            .unwrap()
    }

    pub fn decoded_history(&self, workflow_id: &WorkflowId, run_id: RunId) -> Vec<HistoryEvent> {
        let execution = WorkflowExecution::new(workflow_id.clone(), run_id);
        self.store
            .history_batches(&self.domain_id, &execution)
            .iter()
            .flat_map(|batch| concepts::events::decode_event_batch(batch).unwrap())
            .collect()
    }
}

pub fn pending_user_timer(
    snapshot: &mut WorkflowSnapshot,
    timer_id: &str,
    started_id: i64,
    expiry: DateTime<Utc>,
    version: i64,
    task_created: bool,
) {
    snapshot.user_timers.insert(
        timer_id.to_string(),
        TimerInfo {
            version: FailoverVersion(version),
            timer_id: timer_id.to_string(),
            started_id: EventId(started_id),
            expiry,
            task_created,
        },
    );
}

#[allow(clippy::too_many_arguments)]
pub fn pending_activity(
    snapshot: &mut WorkflowSnapshot,
    schedule_id: i64,
    scheduled_at: DateTime<Utc>,
    started_id: Option<(i64, DateTime<Utc>)>,
    start_to_close: Duration,
    retry_policy: Option<RetryPolicy>,
    timer_status: u32,
    version: i64,
) {
    let (started_id, started_time) = match started_id {
        Some((id, time)) => (EventId(id), time),
        None => (EventId::EMPTY, DateTime::<Utc>::UNIX_EPOCH),
    };
    snapshot.activities.insert(
        EventId(schedule_id),
        ActivityInfo {
            version: FailoverVersion(version),
            schedule_id: EventId(schedule_id),
            scheduled_time: scheduled_at,
            started_id,
            started_time,
            activity_id: format!("activity-{schedule_id}"),
            task_list: "orders".to_string(),
            domain: None,
            schedule_to_close_timeout: Duration::from_secs(300),
            schedule_to_start_timeout: Duration::from_secs(30),
            start_to_close_timeout: start_to_close,
            heartbeat_timeout: None,
            last_heartbeat_time: DateTime::<Utc>::UNIX_EPOCH,
            details: None,
            attempt: 0,
            retry_policy,
            retry_expiration_time: None,
            timer_task_status: timer_status,
            last_timeout_visibility: 0,
        },
    );
}

pub fn pending_decision(snapshot: &mut WorkflowSnapshot, schedule_id: i64, started_id: i64, version: i64) {
    snapshot.decision = Some(DecisionInfo {
        version: FailoverVersion(version),
        schedule_id: EventId(schedule_id),
        started_id: EventId(started_id),
        request_id: Some(RequestId::generate()),
        start_to_close_timeout: Duration::from_secs(10),
        attempt: 0,
        scheduled_time: at(0),
        started_time: Some(at(0)),
    });
}

pub fn history_event(event_id: i64, timestamp: DateTime<Utc>, version: i64, attributes: EventAttributes) -> HistoryEvent {
    HistoryEvent {
        event_id: EventId(event_id),
        timestamp,
        version: FailoverVersion(version),
        attributes,
    }
}

pub fn timer_started_event(event_id: i64, timestamp: DateTime<Utc>, version: i64) -> HistoryEvent {
    history_event(
        event_id,
        timestamp,
        version,
        EventAttributes::TimerStarted {
            timer_id: format!("timer-{event_id}"),
            start_to_fire_timeout: Duration::from_secs(600),
            decision_completed_event_id: EventId::EMPTY,
        },
    )
}

pub fn started_event(
    event_id: i64,
    timestamp: DateTime<Utc>,
    version: i64,
    continued_run_id: Option<RunId>,
) -> HistoryEvent {
    history_event(
        event_id,
        timestamp,
        version,
        EventAttributes::WorkflowExecutionStarted(
            concepts::events::WorkflowExecutionStartedAttributes {
                workflow_type: "order".to_string(),
                task_list: "orders".to_string(),
                execution_timeout: Duration::from_secs(3600),
                decision_timeout: Duration::from_secs(10),
                request_id: RequestId::generate(),
                continued_run_id,
                parent: None,
            },
        ),
    )
}
