//! Single-slot timer scheduler for the poll loop.
//!
//! Arbitrarily many [`TimerGate::update`] calls coalesce into at most one
//! [`GateSignal::Fired`] per actual fire: re-arming only ever moves the
//! fire time earlier, and firing disarms the gate. Expiry is judged against
//! the caller's clock, not the tokio timer wheel, so shard-clock driven
//! waits stay correct under failover.

use chrono::{DateTime, Utc};
use concepts::time::{ClockFn, Sleep};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, PartialEq, Eq)]
pub enum GateSignal {
    Fired,
    Closed,
}

pub struct TimerGate {
    fire_time: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for TimerGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fire_time: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Arms the gate at `time` if that is earlier than the current setting.
    /// Returns whether the setting changed.
    pub fn update(&self, time: DateTime<Utc>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let rearmed = {
            let mut fire_time = self.fire_time.lock().unwrap();
            match *fire_time {
                Some(current) if current <= time => false,
                _ => {
                    *fire_time = Some(time);
                    true
                }
            }
        };
        if rearmed {
            trace!(%time, "Timer gate re-armed");
            self.notify.notify_one();
        }
        rearmed
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until the armed instant passes (disarming the gate) or the
    /// gate is closed.
    pub async fn wait<C: ClockFn, S: Sleep>(&self, clock: &C, sleep: &S) -> GateSignal {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return GateSignal::Closed;
            }
            let target = *self.fire_time.lock().unwrap();
            match target {
                None => notified.await,
                Some(fire_at) => {
                    let now = clock.now();
                    if now >= fire_at {
                        *self.fire_time.lock().unwrap() = None;
                        return GateSignal::Fired;
                    }
                    let remaining = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        () = sleep.sleep(remaining) => {}
                        () = notified => {}
                    }
                }
            }
        }
    }
}
