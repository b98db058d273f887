use crate::error::AppError;
use crate::market::backfill::unix_now_secs;
use crate::market::spot::SpotPriceSource;
use crate::market::types::{MovingAverages, ServiceState};
use crate::state::{AppState, LatestPrice};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Feeds one observed price into the shared window and updates the status.
pub fn record_tick(
    state: &AppState,
    timestamp: i64,
    price: f64,
) -> Result<MovingAverages, AppError> {
    let result = state.averager.lock().update(price);

    match &result {
        Ok(averages) => {
            *state.latest_price.write() = Some(LatestPrice { price, timestamp });
            state.set_status(ServiceState::Live);
            info!(
                price,
                ma_short = averages.ma_short,
                ma_long = averages.ma_long,
                "price updated"
            );
        }
        Err(AppError::InsufficientData { have, need }) => {
            *state.latest_price.write() = Some(LatestPrice { price, timestamp });
            state.set_status(ServiceState::Warming);
            debug!(price, have, need, "window still warming");
        }
        Err(error) => {
            warn!(price, %error, "rejected price update");
        }
    }

    result
}

/// Polls the spot source every `tick_interval` until cancelled.
pub async fn run_tick_loop(
    state: Arc<AppState>,
    spot: Arc<dyn SpotPriceSource>,
    tick_interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = tick_interval.as_secs(), "live tick loop started");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            _ = cancel_token.cancelled() => break,
            fetched = spot.latest_price() => fetched,
        };

        match fetched {
            Ok(price) => {
                let _ = record_tick(&state, unix_now_secs(), price);
            }
            Err(error) => {
                state.set_status(ServiceState::Degraded);
                warn!(%error, "live price unavailable");
            }
        }
    }

    state.set_status(ServiceState::Stopped);
    info!("live tick loop stopped");
}
