pub mod commands;
pub mod config;
pub mod error;
pub mod market;
pub mod state;

use config::BackendConfigArgs;
use error::AppError;
use market::backfill::BackfillEngine;
use market::coingecko::CoinGeckoRangeSource;
use market::pipeline::run_tick_loop;
use market::rate_limiter::IntervalRateLimiter;
use market::retry::RetryPolicy;
use market::spot::{FallbackSpotSource, SpotProvider};
use market::store::CsvTickStore;
use market::types::{WindowSpec, MIN_REQUEST_INTERVAL_MS};
use reqwest::Client;
use state::{warm_averager, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Reconciles the store once, warms the window from it, then tracks the live
/// price until Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    let config = BackendConfigArgs::from_env()?.normalize()?;
    let client = Client::builder().timeout(config.request_timeout).build()?;

    let store = Arc::new(CsvTickStore::new(
        config.store_path.clone(),
        config.lock_options.clone(),
    )?);
    let engine = BackfillEngine::new(
        Arc::new(CoinGeckoRangeSource::new(
            client.clone(),
            config.range_url.clone(),
        )),
        Arc::new(IntervalRateLimiter::new(Duration::from_millis(
            MIN_REQUEST_INTERVAL_MS,
        ))),
        store.clone(),
        RetryPolicy::backfill(),
    );

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    info!(store = %config.store_path.display(), "starting pi cycle backend");
    if !engine.run_backfill(&cancel_token).await {
        warn!("backfill failed, continuing with existing store");
    }

    let spec = WindowSpec::PI_CYCLE;
    let history = match store.recent_typical_prices(spec.long).await {
        Ok(prices) => prices,
        Err(error) => {
            warn!(%error, "could not read history, warming from live ticks");
            Vec::new()
        }
    };
    let averager = warm_averager(spec, history);
    info!(
        window_len = averager.len(),
        warm = averager.is_warm(),
        "moving average window initialised"
    );

    let tick_interval = config.tick_interval;
    let state = Arc::new(AppState::new(config, engine, averager));
    let spot = Arc::new(FallbackSpotSource::new(
        client,
        SpotProvider::DEFAULT_ORDER.to_vec(),
    ));

    run_tick_loop(state, spot, tick_interval, cancel_token).await;
    Ok(())
}
