use crate::error::AppError;
use crate::market::types::{MovingAverages, WindowSpec};
use std::collections::VecDeque;

/// Running means over the last `short` and `long` prices.
///
/// `sum_long` always covers the whole buffer and `sum_short` the newest
/// `min(len, short)` entries, including while the buffer is still filling.
#[derive(Debug, Clone)]
pub struct SlidingWindowAverager {
    spec: WindowSpec,
    buffer: VecDeque<f64>,
    sum_short: f64,
    sum_long: f64,
}

impl SlidingWindowAverager {
    pub fn empty(spec: WindowSpec) -> Self {
        Self {
            spec,
            buffer: VecDeque::with_capacity(spec.long + 1),
            sum_short: 0.0,
            sum_long: 0.0,
        }
    }

    /// Seeds the window from history. Anything other than zero or exactly
    /// `spec.long` prices is rejected.
    pub fn prewarmed(spec: WindowSpec, prices: Vec<f64>) -> Result<Self, AppError> {
        if !prices.is_empty() && prices.len() != spec.long {
            return Err(AppError::Configuration(format!(
                "pre-warm needs exactly {} prices, got {}",
                spec.long,
                prices.len()
            )));
        }
        if let Some(bad) = prices.iter().find(|price| !price.is_finite()) {
            return Err(AppError::Configuration(format!(
                "pre-warm contains a non-finite price ({bad})"
            )));
        }

        let mut averager = Self::empty(spec);
        averager.buffer.extend(prices);
        averager.resync();
        Ok(averager)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_warm(&self) -> bool {
        self.buffer.len() == self.spec.long
    }

    /// `(sum_short, sum_long)`
    pub fn sums(&self) -> (f64, f64) {
        (self.sum_short, self.sum_long)
    }

    /// Pushes one price. State changes even when the window is still short,
    /// in which case the call reports `InsufficientData`.
    pub fn update(&mut self, price: f64) -> Result<MovingAverages, AppError> {
        if !price.is_finite() {
            return Err(AppError::InvalidArgument(format!(
                "price must be finite, got {price}"
            )));
        }

        self.buffer.push_back(price);
        self.sum_long += price;
        if self.buffer.len() > self.spec.long {
            if let Some(evicted) = self.buffer.pop_front() {
                self.sum_long -= evicted;
            }
        }

        let len = self.buffer.len();
        self.sum_short += price;
        if len > self.spec.short {
            self.sum_short -= self.buffer[len - self.spec.short - 1];
        }

        if len < self.spec.long {
            return Err(AppError::InsufficientData {
                have: len,
                need: self.spec.long,
            });
        }

        Ok(self.moving_averages())
    }

    /// Current means, or `None` for each window that is not yet full.
    pub fn moving_averages(&self) -> MovingAverages {
        let len = self.buffer.len();
        MovingAverages {
            ma_short: (len >= self.spec.long).then(|| self.sum_short / self.spec.short as f64),
            ma_long: (len >= self.spec.long).then(|| self.sum_long / self.spec.long as f64),
        }
    }

    /// Recomputes both sums from the buffer, discarding accumulated drift.
    pub fn resync(&mut self) {
        self.sum_long = self.buffer.iter().sum();
        let skip = self.buffer.len().saturating_sub(self.spec.short);
        self.sum_short = self.buffer.iter().skip(skip).sum();
    }
}
