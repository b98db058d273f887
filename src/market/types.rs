use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_MINUTE: i64 = 60;
pub const MINUTES_PER_DAY: usize = 24 * 60;
pub const SHORT_WINDOW_DAYS: usize = 111;
pub const LONG_WINDOW_DAYS: usize = 350;
pub const BATCH_SIZE_MINUTES: i64 = 1_440;
pub const UP_TO_DATE_THRESHOLD_SECS: i64 = 60;
pub const RESUME_LOOKBACK_RECORDS: usize = 10;
pub const MILLISECONDS_THRESHOLD: f64 = 1e12;
pub const MIN_REQUEST_INTERVAL_MS: u64 = 1_500;
pub const RATE_LIMIT_COOLDOWN_SECS: u64 = 60;
pub const MAX_FETCH_ATTEMPTS: usize = 3;

/// One persisted minute observation. Field names match the store's CSV header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Volume")]
    pub volume: Option<f64>,
}

impl Tick {
    pub fn from_price(timestamp: i64, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: None,
        }
    }

    /// Midpoint of the bar range averaged with the open/close midpoint.
    pub fn typical_price(&self) -> f64 {
        ((self.high + self.low) / 2.0 + (self.open + self.close) / 2.0) / 2.0
    }
}

/// Half-open `[from, to)` request window in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub from: i64,
    pub to: i64,
}

impl FetchRange {
    pub fn width_secs(&self) -> i64 {
        self.to - self.from
    }
}

/// A `[timestamp, price]` pair exactly as the range source returned it.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct RawPricePoint(pub f64, pub f64);

impl RawPricePoint {
    pub fn timestamp_secs(&self) -> i64 {
        normalize_timestamp(self.0)
    }

    pub fn price(&self) -> f64 {
        self.1
    }
}

/// Sources mix second and millisecond timestamps. Anything past the
/// millisecond threshold is scaled down, then truncated to whole seconds.
pub fn normalize_timestamp(raw: f64) -> i64 {
    if raw.abs() > MILLISECONDS_THRESHOLD {
        (raw / 1_000.0) as i64
    } else {
        raw as i64
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeResponseWire {
    pub prices: Option<Vec<RawPricePoint>>,
}

pub fn parse_range_payload(payload: &mut [u8]) -> Result<Vec<RawPricePoint>, AppError> {
    let wire: RangeResponseWire = simd_json::serde::from_slice(payload)?;
    wire.prices.ok_or_else(|| {
        AppError::TransientFetch("unexpected range response format: missing 'prices'".to_string())
    })
}

/// Short and long window lengths, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub short: usize,
    pub long: usize,
}

impl WindowSpec {
    pub const PI_CYCLE: WindowSpec = WindowSpec {
        short: SHORT_WINDOW_DAYS * MINUTES_PER_DAY,
        long: LONG_WINDOW_DAYS * MINUTES_PER_DAY,
    };

    pub fn new(short: usize, long: usize) -> Result<Self, AppError> {
        if short == 0 || short >= long {
            return Err(AppError::Configuration(format!(
                "window sizes must satisfy 0 < short < long (got short={short}, long={long})"
            )));
        }
        Ok(Self { short, long })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MovingAverages {
    pub ma_short: Option<f64>,
    pub ma_long: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub last_timestamp: i64,
    pub up_to_date: bool,
    pub batches_planned: usize,
    pub batches_failed: usize,
    pub records_appended: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Warming,
    Live,
    Degraded,
    Stopped,
}
