//! History events and their persisted batch encoding.

use crate::{DomainId, EventId, FailoverVersion, RequestId, RunId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::IntoStaticStr;

pub const EVENT_BATCH_DATA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum TimeoutKind {
    StartToClose,
    ScheduleToStart,
    ScheduleToClose,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// 0 means unlimited attempts.
    pub maximum_attempts: u32,
    /// Total budget measured from the first schedule.
    pub expiration_interval: Option<Duration>,
}

impl RetryPolicy {
    /// Backoff before the given (0-based) attempt's retry.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt as i32);
        let backoff = self.initial_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(backoff.min(self.maximum_interval.as_secs_f64()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentExecutionInfo {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub initiated_event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStartedAttributes {
    pub workflow_type: String,
    pub task_list: String,
    pub execution_timeout: Duration,
    pub decision_timeout: Duration,
    pub request_id: RequestId,
    /// Set when this run was started by continue-as-new of a previous run.
    pub continued_run_id: Option<RunId>,
    pub parent: Option<ParentExecutionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskScheduledAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    /// Target domain name when the activity runs in a foreign domain.
    pub domain: Option<String>,
    pub schedule_to_close_timeout: Duration,
    pub schedule_to_start_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
pub enum EventAttributes {
    WorkflowExecutionStarted(WorkflowExecutionStartedAttributes),
    DecisionTaskScheduled {
        task_list: String,
        start_to_close_timeout: Duration,
        attempt: u32,
    },
    DecisionTaskStarted {
        scheduled_event_id: EventId,
        request_id: RequestId,
    },
    DecisionTaskCompleted {
        scheduled_event_id: EventId,
        started_event_id: EventId,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: EventId,
        started_event_id: EventId,
        timeout_kind: TimeoutKind,
    },
    DecisionTaskFailed {
        scheduled_event_id: EventId,
        started_event_id: EventId,
        cause: DecisionFailedCause,
    },
    TimerStarted {
        timer_id: String,
        start_to_fire_timeout: Duration,
        decision_completed_event_id: EventId,
    },
    TimerFired {
        timer_id: String,
        started_event_id: EventId,
    },
    ActivityTaskScheduled(ActivityTaskScheduledAttributes),
    ActivityTaskStarted {
        scheduled_event_id: EventId,
        attempt: u32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: EventId,
        started_event_id: EventId,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: EventId,
        started_event_id: EventId,
        timeout_kind: TimeoutKind,
        details: Option<Vec<u8>>,
    },
    WorkflowExecutionCompleted {
        decision_completed_event_id: EventId,
    },
    WorkflowExecutionFailed {
        decision_completed_event_id: EventId,
        reason: String,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew {
        decision_completed_event_id: EventId,
        new_run_id: RunId,
    },
}

impl EventAttributes {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionFailedCause {
    ForceCloseDecision,
    UnhandledDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub version: FailoverVersion,
    pub attributes: EventAttributes,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryCodecError {
    #[error("cannot encode history batch: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cannot decode history batch: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unsupported data version {0}")]
    UnsupportedDataVersion(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum Encoding {
    Json,
}

/// Serialized form of one contiguous event batch, as stored in the events
/// table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEventBatch {
    pub data: Vec<u8>,
    pub encoding: Encoding,
    pub data_version: i32,
}

pub fn encode_event_batch(events: &[HistoryEvent]) -> Result<EncodedEventBatch, HistoryCodecError> {
    let data = serde_json::to_vec(events).map_err(HistoryCodecError::Encode)?;
    Ok(EncodedEventBatch {
        data,
        encoding: Encoding::Json,
        data_version: EVENT_BATCH_DATA_VERSION,
    })
}

pub fn decode_event_batch(batch: &EncodedEventBatch) -> Result<Vec<HistoryEvent>, HistoryCodecError> {
    if batch.data_version > EVENT_BATCH_DATA_VERSION {
        return Err(HistoryCodecError::UnsupportedDataVersion(batch.data_version));
    }
    serde_json::from_slice(&batch.data).map_err(HistoryCodecError::Decode)
}

/// Opaque pagination token for history reads. Carries the highest batch
/// version seen so far: after a conflict reset rewrites the tail of a
/// history, pages must skip batches older than what the reader already
/// consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPageToken {
    pub last_event_batch_version: Option<FailoverVersion>,
    pub cursor: Vec<u8>,
}

impl HistoryPageToken {
    #[must_use]
    pub fn start() -> Self {
        Self {
            last_event_batch_version: None,
            cursor: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Option<Vec<u8>>, HistoryCodecError> {
        if self.cursor.is_empty() {
            return Ok(None);
        }
        serde_json::to_vec(self)
            .map(Some)
            .map_err(HistoryCodecError::Encode)
    }

    pub fn decode(bytes: Option<&[u8]>) -> Result<Self, HistoryCodecError> {
        match bytes {
            None => Ok(Self::start()),
            Some([]) => Ok(Self::start()),
            Some(data) => serde_json::from_slice(data).map_err(HistoryCodecError::Decode),
        }
    }
}
