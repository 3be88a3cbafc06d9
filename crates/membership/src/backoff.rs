//! Provides retry timing for the bounded polls done while a membership
//! change is in progress.
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Determines how long to back off before performing a retry.
#[async_trait::async_trait]
pub trait BackoffStrategy: Send {
    /// Resets the strategy after a success.
    fn reset(&mut self);
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
    /// Waits the prescribed amount of time (as per `next_duration`).
    async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}

/// A `BackoffStrategy` that always waits the same amount of time.
#[derive(Clone, Debug)]
pub struct FixedBackoffStrategy {
    interval: Duration,
}

impl FixedBackoffStrategy {
    /// Creates a strategy waiting `interval` between attempts.
    pub fn new(interval: Duration) -> Self {
        FixedBackoffStrategy { interval }
    }
}

impl Default for FixedBackoffStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl BackoffStrategy for FixedBackoffStrategy {
    fn reset(&mut self) {}

    fn next_duration(&mut self) -> Duration {
        self.interval
    }
}

/// Calls `check` until it reports readiness or `max_attempts` calls were made.
///
/// `check` receives the 1-based attempt number. Returns `true` when the
/// condition was met and `false` when the attempts ran out. There is no wait
/// after the last attempt. Cancellation is honoured at every await point, so
/// dropping the returned future stops the poll between attempts.
pub async fn poll_until<B, F, Fut>(backoff: &mut B, max_attempts: u32, mut check: F) -> bool
where
    B: BackoffStrategy,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=max_attempts {
        if check(attempt).await {
            backoff.reset();
            return true;
        }
        if attempt < max_attempts {
            debug!(attempt, max_attempts, "Condition not met yet, retrying");
            backoff.wait().await;
        }
    }
    false
}
