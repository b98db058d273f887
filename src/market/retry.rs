use crate::error::{AppError, RetryClass};
use crate::market::types::{MAX_FETCH_ATTEMPTS, RATE_LIMIT_COOLDOWN_SECS};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Jittered exponential backoff with a separate cooldown for 429 responses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
    pub rate_limit_cooldown: Duration,
}

/// Last error of a retry loop together with how many attempts were made.
#[derive(Debug)]
pub struct RetryError {
    pub attempts: usize,
    pub source: AppError,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        base_delay: Duration,
        max_delay: Duration,
        jitter_pct: f64,
        rate_limit_cooldown: Duration,
    ) -> Self {
        let base_delay = base_delay.max(Duration::from_millis(1));
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
            rate_limit_cooldown,
        }
    }

    pub fn backfill() -> Self {
        Self::new(
            MAX_FETCH_ATTEMPTS,
            Duration::from_secs(1),
            Duration::from_secs(30),
            0.25,
            Duration::from_secs(RATE_LIMIT_COOLDOWN_SECS),
        )
    }

    pub fn next_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(16) as u32;
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(1_u64 << exponent).min(max_ms);

        if self.jitter_pct <= 0.0 {
            return Duration::from_millis(delay_ms);
        }

        let spread = (delay_ms as f64 * self.jitter_pct) as i64;
        let delta = rand::rng().random_range(-spread..=spread);
        Duration::from_millis(delay_ms.saturating_add_signed(delta))
    }

    /// Runs `op` until it succeeds, returns a fatal error, or runs out of
    /// attempts. Sleeps between attempts observe `cancel`.
    pub async fn retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 0;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;

            let exhausted = attempt >= self.max_attempts;
            let delay = match error.retry_class() {
                RetryClass::Fatal => {
                    return Err(RetryError {
                        attempts: attempt,
                        source: error,
                    })
                }
                // Cooldown follows every 429, the last attempt included.
                RetryClass::RateLimited => self.rate_limit_cooldown,
                RetryClass::Transient if exhausted => {
                    return Err(RetryError {
                        attempts: attempt,
                        source: error,
                    })
                }
                RetryClass::Transient => self.next_delay(attempt - 1),
            };

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "attempt failed"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError {
                        attempts: attempt,
                        source: AppError::Cancelled,
                    })
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if exhausted {
                return Err(RetryError {
                    attempts: attempt,
                    source: error,
                });
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backfill()
    }
}
