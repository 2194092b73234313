//! Backoff for re-dispatched events and a timeout guard for event settlement.
//!
//! The worker never retries on its own. A background-sync event that fails is
//! handed back to the container, which re-dispatches it on the schedule
//! described by [`RetryConfig`].

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::DashboardError;

/// Attempt budget and doubling backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Pause before `attempt` (1-based): nothing before the first, then
    /// `initial_delay` doubling per attempt, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent. The
/// last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let budget = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt == budget {
            warn!(attempt, error = %error, "Giving up");
            return Err(error);
        }

        attempt += 1;
        let pause = config.backoff(attempt);
        debug!(attempt, ?pause, error = %error, "Attempt failed, backing off");
        tokio::time::sleep(pause).await;
    }
}

/// Await `operation`, failing with [`DashboardError::Timeout`] after `limit`.
pub async fn with_timeout<T, F, Fut>(limit: Duration, operation: F) -> Result<T, DashboardError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(limit, operation())
        .await
        .map_err(|_| DashboardError::Timeout(limit))
}
