//! Generic retry loop for outbound calls.
//!
//! Exponential backoff with optional jitter. A platform-supplied
//! Retry-After is honored as a floor on the wait, never shortened.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::SendError;

/// Retry policy for one class of outbound call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: true,
        }
    }

    /// Run an operation until it succeeds, fails permanently, or the
    /// attempt budget runs out.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, SendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SendError>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts.max(1) {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt == self.max_attempts.max(1) {
                        warn!(attempt, error = %e, "Attempt budget exhausted");
                        last_error = Some(e);
                        break;
                    }
                    let delay = self.delay_for(attempt, e.retry_after());
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(SendError::Exhausted {
            attempts: self.max_attempts.max(1),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into()),
        })
    }

    /// Backoff for a given attempt: base * 2^(attempt-1), floored by any
    /// platform-supplied Retry-After, plus up to 20% jitter.
    fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << (attempt - 1).min(10));
        let mut delay = match retry_after {
            Some(floor) => exp.max(floor),
            None => exp,
        };
        if self.jitter {
            let extra = delay.as_millis() as u64 / 5;
            if extra > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=extra));
            }
        }
        delay
    }
}
