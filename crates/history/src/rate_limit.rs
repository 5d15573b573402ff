//! Token-bucket budget for timer-task dispatch.

use concepts::time::Sleep;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RpsLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RpsLimiter {
    #[must_use]
    pub fn new(rps: u32) -> Self {
        let rate = f64::from(rps.max(1));
        Self {
            rate,
            capacity: rate,
            state: Mutex::new(Bucket {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping until the bucket refills when empty.
    pub async fn acquire<S: Sleep>(&self, sleep: &S) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.refilled_at = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            sleep.sleep(wait).await;
        }
    }
}
