use std::future::Future;
use std::time::Duration;

use episode_kernel_core::KernelConfig;
use rand::Rng;
use tracing::warn;

use crate::error::IngestError;

/// Bounded retry with capped exponential backoff and a per-attempt timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            attempt_timeout: config.transaction_timeout(),
        }
    }

    /// `base_delay * 2^retry`, capped at `max_delay`. `retry` counts from zero.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2_u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.checked_mul(factor).unwrap_or(self.max_delay).min(self.max_delay)
    }

    /// Backoff with equal jitter: half the delay is fixed, the other half random.
    fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.backoff_delay(retry);
        let half = delay / 2;
        let spread = u64::try_from(half.as_micros()).unwrap_or(u64::MAX);
        let jitter = if spread == 0 { 0 } else { rand::thread_rng().gen_range(0..=spread) };
        half + Duration::from_micros(jitter)
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. Retryable failures on the
    /// last attempt become [`IngestError::RetryExhausted`]; an attempt exceeding
    /// `attempt_timeout` ends the call with [`IngestError::Timeout`].
    ///
    /// # Errors
    /// Returns the first terminal error, `RetryExhausted`, or `Timeout`.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, IngestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = tokio::time::timeout(self.attempt_timeout, attempt_fn(attempt)).await;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => {
                    let timeout_ms =
                        u64::try_from(self.attempt_timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(operation, attempt, timeout_ms, "attempt timed out");
                    return Err(IngestError::Timeout { timeout_ms });
                }
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                return Err(IngestError::RetryExhausted { attempts: attempt, last: Box::new(err) });
            }

            let delay = self.jittered_delay(attempt - 1);
            warn!(
                operation,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
