use crate::config::BackendConfig;
use crate::market::averager::SlidingWindowAverager;
use crate::market::backfill::BackfillEngine;
use crate::market::types::{ServiceState, WindowSpec};
use parking_lot::{Mutex, RwLock};
use std::time::Instant;

/// Most recent spot observation fed into the averager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestPrice {
    pub price: f64,
    pub timestamp: i64,
}

pub struct AppState {
    pub started_at: Instant,
    pub config: BackendConfig,
    pub backfill: BackfillEngine,
    pub averager: Mutex<SlidingWindowAverager>,
    pub latest_price: RwLock<Option<LatestPrice>>,
    pub status: RwLock<ServiceState>,
}

impl AppState {
    pub fn new(
        config: BackendConfig,
        backfill: BackfillEngine,
        averager: SlidingWindowAverager,
    ) -> Self {
        let status = if averager.is_warm() {
            ServiceState::Live
        } else {
            ServiceState::Starting
        };

        Self {
            started_at: Instant::now(),
            config,
            backfill,
            averager: Mutex::new(averager),
            latest_price: RwLock::new(None),
            status: RwLock::new(status),
        }
    }

    pub fn set_status(&self, status: ServiceState) {
        *self.status.write() = status;
    }

    pub fn status(&self) -> ServiceState {
        *self.status.read()
    }
}

/// Builds the averager from whatever history the store holds. A full window
/// is used as a pre-warm; a shorter history is streamed in so warming
/// continues from live ticks.
pub fn warm_averager(spec: WindowSpec, prices: Vec<f64>) -> SlidingWindowAverager {
    if prices.len() == spec.long && prices.iter().all(|price| price.is_finite()) {
        return SlidingWindowAverager::prewarmed(spec, prices)
            .unwrap_or_else(|_| SlidingWindowAverager::empty(spec));
    }

    let mut averager = SlidingWindowAverager::empty(spec);
    for price in prices.into_iter().rev().take(spec.long).rev() {
        let _ = averager.update(price);
    }
    averager
}
