use crate::error::AppError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Gate in front of a rate-limited source.
#[async_trait]
pub trait RequestThrottle: Send + Sync {
    /// Waits until the next request may be sent. Returns `Cancelled` if the
    /// token fires first; the slot is then left unclaimed.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AppError>;
}

/// Admits one caller at a time, each at least `min_interval` after the
/// previous admission. Waiters queue on a FIFO mutex.
#[derive(Debug)]
pub struct IntervalRateLimiter {
    min_interval: Duration,
    last_admitted: Mutex<Option<Instant>>,
}

impl IntervalRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admitted: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RequestThrottle for IntervalRateLimiter {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let mut last_admitted = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            guard = self.last_admitted.lock() => guard,
        };

        if let Some(previous) = *last_admitted {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                debug!(
                    wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "rate limiter waiting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    _ = tokio::time::sleep_until(ready_at) => {}
                }
            }
        }

        *last_admitted = Some(Instant::now());
        Ok(())
    }
}
