use crate::error::AppError;
use crate::market::coingecko::COINGECKO_RANGE_URL;
use crate::market::lock::LockOptions;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STORE_PATH: &str = "btcusd_1-min_data.csv";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const MIN_TICK_INTERVAL_SECS: u64 = 1;
pub const MAX_TICK_INTERVAL_SECS: u64 = 3_600;
pub const MIN_LOCK_TIMEOUT_MS: u64 = 10;
pub const MAX_LOCK_TIMEOUT_MS: u64 = 600_000;

const STORE_PATH_VAR: &str = "PI_CYCLE_STORE_PATH";
const RANGE_URL_VAR: &str = "PI_CYCLE_RANGE_URL";
const REQUEST_TIMEOUT_VAR: &str = "PI_CYCLE_REQUEST_TIMEOUT_MS";
const TICK_INTERVAL_VAR: &str = "PI_CYCLE_TICK_INTERVAL_SECS";
const LOCK_TIMEOUT_VAR: &str = "PI_CYCLE_LOCK_TIMEOUT_MS";

/// Raw settings before validation. `None` means "use the default".
#[derive(Debug, Clone, Default)]
pub struct BackendConfigArgs {
    pub store_path: Option<String>,
    pub range_url: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub tick_interval_secs: Option<u64>,
    pub lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub store_path: PathBuf,
    pub range_url: String,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
    pub lock_options: LockOptions,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64(key: &str, value: Option<String>) -> Result<Option<u64>, AppError> {
    non_empty(value)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                AppError::Configuration(format!("{key} must be a non-negative integer, got {raw:?}"))
            })
        })
        .transpose()
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<u64, AppError> {
    if !(min..=max).contains(&value) {
        return Err(AppError::Configuration(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

impl BackendConfigArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        Ok(Self {
            store_path: non_empty(lookup(STORE_PATH_VAR)),
            range_url: non_empty(lookup(RANGE_URL_VAR)),
            request_timeout_ms: parse_u64(REQUEST_TIMEOUT_VAR, lookup(REQUEST_TIMEOUT_VAR))?,
            tick_interval_secs: parse_u64(TICK_INTERVAL_VAR, lookup(TICK_INTERVAL_VAR))?,
            lock_timeout_ms: parse_u64(LOCK_TIMEOUT_VAR, lookup(LOCK_TIMEOUT_VAR))?,
        })
    }

    pub fn normalize(self) -> Result<BackendConfig, AppError> {
        let store_path = PathBuf::from(
            self.store_path
                .unwrap_or_else(|| DEFAULT_STORE_PATH.to_string()),
        );

        let range_url = self
            .range_url
            .unwrap_or_else(|| COINGECKO_RANGE_URL.to_string());
        if !(range_url.starts_with("https://") || range_url.starts_with("http://")) {
            return Err(AppError::Configuration(
                "range url must be an http(s) URL".to_string(),
            ));
        }

        let request_timeout_ms = check_range(
            "request timeout (ms)",
            self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            MIN_REQUEST_TIMEOUT_MS,
            MAX_REQUEST_TIMEOUT_MS,
        )?;
        let tick_interval_secs = check_range(
            "tick interval (s)",
            self.tick_interval_secs.unwrap_or(DEFAULT_TICK_INTERVAL_SECS),
            MIN_TICK_INTERVAL_SECS,
            MAX_TICK_INTERVAL_SECS,
        )?;
        let acquire_timeout = self
            .lock_timeout_ms
            .map(|ms| {
                check_range(
                    "lock timeout (ms)",
                    ms,
                    MIN_LOCK_TIMEOUT_MS,
                    MAX_LOCK_TIMEOUT_MS,
                )
            })
            .transpose()?
            .map(Duration::from_millis);

        Ok(BackendConfig {
            store_path,
            range_url,
            request_timeout: Duration::from_millis(request_timeout_ms),
            tick_interval: Duration::from_secs(tick_interval_secs),
            lock_options: LockOptions {
                acquire_timeout,
                ..LockOptions::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args_from(pairs: &[(&str, &str)]) -> Result<BackendConfigArgs, AppError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        BackendConfigArgs::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = BackendConfigArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.store_path, PathBuf::from(DEFAULT_STORE_PATH));
        assert_eq!(config.range_url, COINGECKO_RANGE_URL);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.lock_options.acquire_timeout, None);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = args_from(&[(STORE_PATH_VAR, "   "), (REQUEST_TIMEOUT_VAR, "")])
            .expect("blank values parse")
            .normalize()
            .expect("defaults apply");

        assert_eq!(config.store_path, PathBuf::from(DEFAULT_STORE_PATH));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn reads_overrides() {
        let config = args_from(&[
            (STORE_PATH_VAR, " /var/lib/pi-cycle/ticks.csv "),
            (RANGE_URL_VAR, "http://127.0.0.1:9000/range"),
            (TICK_INTERVAL_VAR, "5"),
            (LOCK_TIMEOUT_VAR, "2500"),
        ])
        .expect("overrides parse")
        .normalize()
        .expect("overrides are in range");

        assert_eq!(config.store_path, PathBuf::from("/var/lib/pi-cycle/ticks.csv"));
        assert_eq!(config.range_url, "http://127.0.0.1:9000/range");
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(
            config.lock_options.acquire_timeout,
            Some(Duration::from_millis(2_500))
        );
    }

    #[test]
    fn rejects_unparseable_and_out_of_range_values() {
        assert!(matches!(
            args_from(&[(REQUEST_TIMEOUT_VAR, "ten")]),
            Err(AppError::Configuration(_))
        ));

        let too_fast = BackendConfigArgs {
            tick_interval_secs: Some(0),
            ..BackendConfigArgs::default()
        };
        assert!(matches!(
            too_fast.normalize(),
            Err(AppError::Configuration(_))
        ));

        let bad_url = BackendConfigArgs {
            range_url: Some("ftp://example.com".to_string()),
            ..BackendConfigArgs::default()
        };
        assert!(matches!(
            bad_url.normalize(),
            Err(AppError::Configuration(_))
        ));
    }
}
