//! Conflict resolution for diverged histories: rebuild mutable state from
//! the prefix of history both clusters agree on and install it over the
//! diverged copy.

use crate::cache::ExecutionGuard;
use crate::shard::ShardContext;
use crate::state_builder::StateBuilder;
use chrono::{DateTime, Utc};
use concepts::events::decode_event_batch;
use concepts::storage::{ReadHistoryRequest, ResetWorkflowExecutionRequest, StoreError};
use concepts::time::ClockFn;
use concepts::{EventId, RequestId};
use tracing::{info, instrument};

/// Rewind the run to end just before `replay_next_event_id`: replay
/// history `[1, replay_next_event_id)` into a fresh mutable state keeping
/// the original start timestamp, persist it over the diverged state, and
/// install it in the context. Post-condition:
/// `state.next_event_id() == replay_next_event_id`.
#[instrument(skip_all, fields(execution = %guard.execution(), %replay_next_event_id))]
pub async fn reset<C: ClockFn>(
    shard: &ShardContext<C>,
    guard: &mut ExecutionGuard<C>,
    request_id: RequestId,
    replay_next_event_id: EventId,
    start_time: DateTime<Utc>,
) -> Result<(), StoreError> {
    let domain_id = guard.domain_id();
    let execution = guard.execution().clone();
    let builder = StateBuilder::new(shard.config().history_retention);

    let mut state = None;
    let mut page_token = None;
    loop {
        let response = shard
            .history_store()
            .read_history(ReadHistoryRequest {
                domain_id,
                execution: execution.clone(),
                first_event_id: EventId::FIRST,
                next_event_id: replay_next_event_id,
                page_size: shard.config().history_page_size,
                page_token,
            })
            .await?;
        for batch in &response.batches {
            let events = decode_event_batch(batch)?;
            let Some(first) = events.first() else {
                continue;
            };
            let state = state.get_or_insert_with(|| {
                crate::mutable_state::MutableState::new_for_replication(
                    domain_id,
                    execution.clone(),
                    first.version,
                )
            });
            builder.apply_events(state, domain_id, &execution, &events, None)?;
        }
        match response.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    let mut state =
        state.ok_or_else(|| StoreError::Internal("no history to replay".to_string()))?;
    if state.next_event_id() != replay_next_event_id {
        return Err(StoreError::Internal(format!(
            "replay ended at {} instead of {replay_next_event_id}",
            state.next_event_id()
        )));
    }
    state.execution_info_mut().create_request_id = request_id;
    state.execution_info_mut().start_timestamp = start_time;

    shard
        .execution_store()
        .reset_workflow_execution(ResetWorkflowExecutionRequest {
            snapshot: state.snapshot_for_commit(),
            range_id: shard.range_id(),
        })
        .await?;
    state.mark_committed();
    info!(next_event_id = %state.next_event_id(), "Reset workflow execution");
    guard.install(state);
    Ok(())
}
