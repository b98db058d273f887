use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store has no records: {0}")]
    EmptyStore(String),
    #[error("no valid timestamp in the last {lookback} records of {path}")]
    CorruptStore { path: String, lookback: usize },
    #[error("transient fetch error: {0}")]
    TransientFetch(String),
    #[error("rate limited by source (status 429)")]
    RateLimited,
    #[error("batch [{from}, {to}) failed after {attempts} attempts: {reason}")]
    BatchFailed {
        from: i64,
        to: i64,
        attempts: usize,
        reason: String,
    },
    #[error("insufficient data: have {have} prices, need {need}")]
    InsufficientData { have: usize, need: usize },
    #[error("failed to release lock {path}: {reason}")]
    LockRelease { path: String, reason: String },
    #[error("timed out after {waited_ms}ms waiting for lock {path}")]
    LockTimeout { path: String, waited_ms: u128 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("all spot price sources failed")]
    AllSourcesFailed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How a failed fetch attempt should be treated by a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Try again after the backoff delay.
    Transient,
    /// Try again after the source cooldown; counts as an attempt.
    RateLimited,
    /// Stop immediately and surface the error.
    Fatal,
}

impl AppError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::TransientFetch(_) | Self::Reqwest(_) | Self::SimdJson(_) | Self::Io(_) => {
                RetryClass::Transient
            }
            Self::RateLimited => RetryClass::RateLimited,
            _ => RetryClass::Fatal,
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
