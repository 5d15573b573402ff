use chrono::{DateTime, Utc};
use concepts::time::ClockFn;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Manually advanced clock shared between the test body and the code under
/// test.
#[derive(Clone)]
pub struct SimClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl SimClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(now)),
        }
    }

    /// Fixed epoch so assertions on derived timestamps stay stable.
    #[must_use]
    pub fn epoch() -> Self {
        Self::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    pub fn advance(&self, duration: Duration) {
        let mut guard = self.current_time.lock().unwrap();
        let old = *guard;
        *guard = old + duration;
        info!("Advanced clock from `{old}` to `{}`", *guard);
    }
}

impl ClockFn for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap()
    }
}
