//! Sliding-window acknowledgement of timer tasks.
//!
//! `read_level` is the exclusive upper bound of what has been handed to
//! workers; `ack_level` trails it and only advances through the completed
//! prefix, so the persisted level never overtakes an in-flight timer.
//! Completed tasks are deleted from the store before the level moves.

use crate::shard::ShardContext;
use concepts::cluster::ClusterName;
use concepts::storage::StoreError;
use concepts::tasks::{TimerKey, TimerTask};
use concepts::time::ClockFn;
use concepts::{DomainId, TaskId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, trace};

/// Active managers drain the whole queue; failover managers drain one
/// domain's timers up to a ceiling and then report finished.
#[derive(Debug, Clone)]
enum AckKind {
    Active,
    Failover {
        domain_id: DomainId,
        from_cluster: ClusterName,
        max_level: DateTime<Utc>,
    },
}

struct AckInner {
    read_level: TimerKey,
    ack_level: TimerKey,
    // key -> completed
    outstanding: BTreeMap<TimerKey, bool>,
}

pub struct TimerAckManager<C: ClockFn> {
    shard: Arc<ShardContext<C>>,
    kind: AckKind,
    inner: Mutex<AckInner>,
}

#[derive(Debug, Clone)]
pub struct TimerReadBatch {
    pub tasks: Vec<TimerTask>,
    pub more_available: bool,
    /// First not-yet-due task seen, for arming the timer gate.
    pub look_ahead: Option<TimerTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckProgress {
    pub ack_level: TimerKey,
    /// Failover drain complete: the ack level reached the ceiling.
    pub finished: bool,
}

impl<C: ClockFn> TimerAckManager<C> {
    #[must_use]
    pub fn new_active(shard: Arc<ShardContext<C>>) -> Self {
        let level = shard.timer_ack_level();
        Self {
            shard,
            kind: AckKind::Active,
            inner: Mutex::new(AckInner {
                read_level: level,
                ack_level: level,
                outstanding: BTreeMap::new(),
            }),
        }
    }

    /// Failover manager for one (domain, standby cluster) pair, draining
    /// `[min_level, max_level)`. Resumes from a previously persisted
    /// failover ack level when one exists.
    #[must_use]
    pub fn new_failover(
        shard: Arc<ShardContext<C>>,
        domain_id: DomainId,
        from_cluster: ClusterName,
        min_level: DateTime<Utc>,
        max_level: DateTime<Utc>,
    ) -> Self {
        let level = shard
            .failover_ack_level(&domain_id, &from_cluster)
            .unwrap_or_else(|| TimerKey::new(min_level, TaskId(0)));
        Self {
            shard,
            kind: AckKind::Failover {
                domain_id,
                from_cluster,
                max_level,
            },
            inner: Mutex::new(AckInner {
                read_level: level,
                ack_level: level,
                outstanding: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn ack_level(&self) -> TimerKey {
        self.inner.lock().unwrap().ack_level
    }

    #[must_use]
    pub fn read_level(&self) -> TimerKey {
        self.inner.lock().unwrap().read_level
    }

    /// Reads the next batch of due timers after the read level. Every
    /// returned task enters the in-flight set; a not-yet-due task stops the
    /// scan and is surfaced as the look-ahead.
    #[instrument(skip_all)]
    pub async fn read_timer_tasks(&self) -> Result<TimerReadBatch, StoreError> {
        let read_level = self.read_level();
        let batch_size = self.shard.config().timer_batch_size;
        let page = self
            .shard
            .execution_store()
            .get_timer_tasks(read_level, batch_size)
            .await?;
        let now = self.shard.now();

        let mut inner = self.inner.lock().unwrap();
        let mut tasks = Vec::new();
        let mut look_ahead = None;
        let mut hit_ceiling = false;
        for task in page.tasks {
            if let AckKind::Failover { max_level, .. } = &self.kind {
                if task.visibility_timestamp >= *max_level {
                    hit_ceiling = true;
                    break;
                }
            }
            if task.visibility_timestamp > now {
                look_ahead = Some(task);
                break;
            }
            inner.read_level = task.key();
            inner.outstanding.insert(task.key(), false);
            tasks.push(task);
        }
        // Once every task below the ceiling has been read, a failover
        // manager fast-forwards its read level to the ceiling so the ack
        // level can reach it and report the drain finished.
        if hit_ceiling || (look_ahead.is_none() && !page.more_available) {
            if let AckKind::Failover { max_level, .. } = &self.kind {
                inner.read_level = inner.read_level.max(TimerKey::new(*max_level, TaskId(0)));
            }
        }
        let more_available = page.more_available && look_ahead.is_none() && !hit_ceiling;
        trace!(
            read = tasks.len(),
            more_available,
            look_ahead = look_ahead.is_some(),
            "Read timer tasks"
        );
        Ok(TimerReadBatch {
            tasks,
            more_available,
            look_ahead,
        })
    }

    /// Deletes the completed task and marks it in the in-flight window.
    pub async fn complete_timer_task(&self, key: TimerKey) -> Result<(), StoreError> {
        self.shard.execution_store().complete_timer_task(key).await?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(done) = inner.outstanding.get_mut(&key) {
            *done = true;
        }
        Ok(())
    }

    /// Advances the ack level through the completed prefix and persists it
    /// to shard metadata. A CAS failure means lost shard ownership and must
    /// stop the owning processor.
    #[instrument(skip_all)]
    pub async fn update_ack_level(&self) -> Result<AckProgress, StoreError> {
        let (level, finished, kind) = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            while let Some((key, done)) = inner.outstanding.first_key_value() {
                if !*done {
                    break;
                }
                inner.ack_level = *key;
                inner.outstanding.pop_first();
            }
            if inner.outstanding.is_empty() && inner.read_level > inner.ack_level {
                inner.ack_level = inner.read_level;
            }
            let finished = match &self.kind {
                AckKind::Active => false,
                AckKind::Failover { max_level, .. } => {
                    inner.ack_level.visibility_timestamp >= *max_level
                }
            };
            (inner.ack_level, finished, self.kind.clone())
        };
        match kind {
            AckKind::Active => self.shard.update_timer_ack_level(level).await?,
            AckKind::Failover {
                domain_id,
                from_cluster,
                ..
            } => {
                self.shard
                    .update_failover_ack_level(&domain_id, &from_cluster, level)
                    .await?;
            }
        }
        debug!(ack = %level.visibility_timestamp, finished, "Updated timer ack level");
        Ok(AckProgress {
            ack_level: level,
            finished,
        })
    }
}
