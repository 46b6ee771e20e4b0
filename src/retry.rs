//! Bounded exponential backoff shared by the bridge and settlement paths
//!
//! Every retried operation has an attempt counter and a terminal outcome:
//! permanent errors return immediately, transient errors are retried until
//! `max_attempts` is reached and then surface as `RetriesExhausted`.

use crate::error::{RelayerError, RelayerResult};

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Same backoff curve with a different attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> RelayerResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        "{} giving up after {} attempts: {}",
                        operation, attempt, e
                    );
                    return Err(RelayerError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {} (retrying in {:?})",
                        operation, attempt, self.max_attempts, e, delay
                    );
                    crate::metrics::record_retry(operation);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
