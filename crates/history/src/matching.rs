//! Retrying facade over the matching service client: transient failures
//! (busy, timeout) back off and retry; everything else surfaces at once.

use async_trait::async_trait;
use concepts::storage::{
    AddActivityTaskRequest, AddDecisionTaskRequest, MatchingClient, MatchingError,
};
use concepts::time::Sleep;
use std::sync::Arc;
use tracing::debug;

pub struct RetryingMatchingClient<S: Sleep> {
    inner: Arc<dyn MatchingClient>,
    sleep: S,
    max_attempts: usize,
    initial_backoff: std::time::Duration,
}

impl<S: Sleep> RetryingMatchingClient<S> {
    #[must_use]
    pub fn new(
        inner: Arc<dyn MatchingClient>,
        sleep: S,
        max_attempts: usize,
        initial_backoff: std::time::Duration,
    ) -> Self {
        Self {
            inner,
            sleep,
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    async fn with_retries<F, Fut>(&self, mut call: F) -> Result<(), MatchingError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<(), MatchingError>> + Send,
    {
        let mut backoff = self.initial_backoff;
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            match call().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    debug!(attempt, %err, "Transient matching error, backing off");
                    last_err = Some(err);
                    self.sleep.sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| MatchingError::Internal("retries exhausted".to_string())))
    }
}

#[async_trait]
impl<S: Sleep> MatchingClient for RetryingMatchingClient<S> {
    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> Result<(), MatchingError> {
        self.with_retries(|| {
            let request = request.clone();
            let inner = self.inner.clone();
            async move { inner.add_activity_task(request).await }
        })
        .await
    }

    async fn add_decision_task(&self, request: AddDecisionTaskRequest) -> Result<(), MatchingError> {
        self.with_retries(|| {
            let request = request.clone();
            let inner = self.inner.clone();
            async move { inner.add_decision_task(request).await }
        })
        .await
    }
}
