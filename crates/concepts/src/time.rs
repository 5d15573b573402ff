use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Source of the current instant. Production code reads UTC wall clock;
/// tests substitute a manually advanced clock.
pub trait ClockFn: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[async_trait]
pub trait Sleep: Send + Sync + Clone + 'static {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone)]
pub struct UtcClock;

impl ClockFn for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone)]
pub struct TokioSleep;

#[async_trait]
impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
