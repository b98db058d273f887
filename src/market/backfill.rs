use crate::error::AppError;
use crate::market::coingecko::PriceSource;
use crate::market::rate_limiter::RequestThrottle;
use crate::market::retry::RetryPolicy;
use crate::market::store::TickStore;
use crate::market::types::{
    BackfillReport, FetchRange, RawPricePoint, Tick, BATCH_SIZE_MINUTES, RESUME_LOOKBACK_RECORDS,
    SECONDS_PER_MINUTE, UP_TO_DATE_THRESHOLD_SECS,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of scanning the newest store records for a usable timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookback {
    Found(i64),
    NotFound,
}

/// `values` is newest first. Only the first `lookback` entries are examined.
pub fn find_last_valid(values: &[Option<i64>], lookback: usize) -> Lookback {
    values
        .iter()
        .take(lookback)
        .find_map(|value| *value)
        .map_or(Lookback::NotFound, Lookback::Found)
}

pub fn is_up_to_date(last_timestamp: i64, now: i64) -> bool {
    now - last_timestamp < UP_TO_DATE_THRESHOLD_SECS
}

/// Splits the gap after `last_timestamp` into request windows of at most one
/// day. Consecutive windows start one minute after the previous end.
pub fn plan_batches(last_timestamp: i64, now: i64) -> Vec<FetchRange> {
    let batch_secs = BATCH_SIZE_MINUTES * SECONDS_PER_MINUTE;
    let mut batches = Vec::new();
    let mut cursor = last_timestamp + SECONDS_PER_MINUTE;

    while cursor < now {
        let batch_end = (cursor + batch_secs).min(now);
        batches.push(FetchRange {
            from: cursor,
            to: batch_end,
        });
        cursor = batch_end + SECONDS_PER_MINUTE;
    }

    batches
}

pub fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

fn points_after(points: &[RawPricePoint], last_timestamp: i64) -> impl Iterator<Item = Tick> + '_ {
    points.iter().filter_map(move |point| {
        let timestamp = point.timestamp_secs();
        let price = point.price();
        (timestamp > last_timestamp && price.is_finite())
            .then(|| Tick::from_price(timestamp, price))
    })
}

/// Reconciles the tick store with a historical price source.
pub struct BackfillEngine {
    source: Arc<dyn PriceSource>,
    throttle: Arc<dyn RequestThrottle>,
    store: Arc<dyn TickStore>,
    retry: RetryPolicy,
}

impl BackfillEngine {
    pub fn new(
        source: Arc<dyn PriceSource>,
        throttle: Arc<dyn RequestThrottle>,
        store: Arc<dyn TickStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            throttle,
            store,
            retry,
        }
    }

    /// Newest persisted timestamp, looking back past a few malformed rows.
    pub async fn resume_point(&self) -> Result<i64, AppError> {
        let tail = self.store.tail_timestamps(RESUME_LOOKBACK_RECORDS).await?;
        if tail.is_empty() {
            return Err(AppError::EmptyStore(self.store.location()));
        }

        match find_last_valid(&tail, RESUME_LOOKBACK_RECORDS) {
            Lookback::Found(timestamp) => Ok(timestamp),
            Lookback::NotFound => Err(AppError::CorruptStore {
                path: self.store.location(),
                lookback: RESUME_LOOKBACK_RECORDS,
            }),
        }
    }

    /// One throttled request per attempt. Exhausted or fatal failures come
    /// back as `BatchFailed`; cancellation stays `Cancelled`.
    pub async fn fetch_batch(
        &self,
        range: FetchRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawPricePoint>, AppError> {
        let throttle = &self.throttle;
        let source = &self.source;

        self.retry
            .retry(cancel, |attempt| async move {
                throttle.acquire(cancel).await?;
                debug!(from = range.from, to = range.to, attempt, "fetching batch");
                source.fetch_range(range).await
            })
            .await
            .map_err(|failure| match failure.source {
                AppError::Cancelled => AppError::Cancelled,
                other => AppError::BatchFailed {
                    from: range.from,
                    to: range.to,
                    attempts: failure.attempts,
                    reason: other.to_string(),
                },
            })
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<BackfillReport, AppError> {
        self.run_at(unix_now_secs(), cancel).await
    }

    /// Fills the gap between the store's newest record and `now`. Failed
    /// batches are skipped; everything fetched is written in one append.
    pub async fn run_at(
        &self,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, AppError> {
        let last_timestamp = self.resume_point().await?;

        if is_up_to_date(last_timestamp, now) {
            info!(last_timestamp, "store is up to date");
            return Ok(BackfillReport {
                last_timestamp,
                up_to_date: true,
                ..BackfillReport::default()
            });
        }

        let batches = plan_batches(last_timestamp, now);
        info!(
            last_timestamp,
            now,
            batches = batches.len(),
            "backfilling store gap"
        );

        let mut collected: Vec<Tick> = Vec::new();
        let mut batches_failed = 0;

        for range in &batches {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            match self.fetch_batch(*range, cancel).await {
                Ok(points) => {
                    let before = collected.len();
                    collected.extend(points_after(&points, last_timestamp));
                    debug!(
                        from = range.from,
                        to = range.to,
                        received = points.len(),
                        kept = collected.len() - before,
                        "batch fetched"
                    );
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(error) => {
                    batches_failed += 1;
                    warn!(%error, "skipping failed batch");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        collected.sort_by_key(|tick| tick.timestamp);
        collected.dedup_by_key(|tick| tick.timestamp);

        let records_appended = if collected.is_empty() {
            0
        } else {
            self.store.append(collected).await?
        };

        Ok(BackfillReport {
            last_timestamp,
            up_to_date: false,
            batches_planned: batches.len(),
            batches_failed,
            records_appended,
        })
    }

    /// `run` for callers that only need success or failure.
    pub async fn run_backfill(&self, cancel: &CancellationToken) -> bool {
        match self.run(cancel).await {
            Ok(report) => {
                info!(
                    records_appended = report.records_appended,
                    batches_failed = report.batches_failed,
                    up_to_date = report.up_to_date,
                    "backfill finished"
                );
                true
            }
            Err(error) => {
                error!(%error, "backfill failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::lock::LockOptions;
    use crate::market::store::CsvTickStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    const T: i64 = 1_700_000_000;

    #[derive(Default)]
    struct NoThrottle;

    #[async_trait]
    impl RequestThrottle for NoThrottle {
        async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AppError> {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            Ok(())
        }
    }

    type Responder = Box<dyn Fn(FetchRange) -> Result<Vec<RawPricePoint>, AppError> + Send + Sync>;

    struct ScriptedSource {
        calls: Mutex<Vec<FetchRange>>,
        respond: Responder,
    }

    impl ScriptedSource {
        fn new(
            respond: impl Fn(FetchRange) -> Result<Vec<RawPricePoint>, AppError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        /// A source holding one price per minute, reported in milliseconds.
        fn minutely() -> Arc<Self> {
            Self::new(|range| {
                Ok((range.from..range.to)
                    .step_by(SECONDS_PER_MINUTE as usize)
                    .map(|ts| RawPricePoint(ts as f64 * 1_000.0, 40_000.0))
                    .collect())
            })
        }

        fn calls(&self) -> Vec<FetchRange> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn fetch_range(&self, range: FetchRange) -> Result<Vec<RawPricePoint>, AppError> {
            self.calls.lock().push(range);
            (self.respond)(range)
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        tail_override: Option<Vec<Option<i64>>>,
        ticks: Mutex<Vec<Tick>>,
    }

    impl MemoryStore {
        fn with_last(timestamp: i64) -> Arc<Self> {
            Arc::new(Self {
                tail_override: None,
                ticks: Mutex::new(vec![Tick::from_price(timestamp, 39_000.0)]),
            })
        }

        fn timestamps(&self) -> Vec<i64> {
            self.ticks.lock().iter().map(|tick| tick.timestamp).collect()
        }
    }

    #[async_trait]
    impl TickStore for MemoryStore {
        async fn tail_timestamps(&self, max_records: usize) -> Result<Vec<Option<i64>>, AppError> {
            if let Some(tail) = &self.tail_override {
                return Ok(tail.iter().take(max_records).copied().collect());
            }
            Ok(self
                .ticks
                .lock()
                .iter()
                .rev()
                .take(max_records)
                .map(|tick| Some(tick.timestamp))
                .collect())
        }

        async fn append(&self, ticks: Vec<Tick>) -> Result<usize, AppError> {
            let count = ticks.len();
            self.ticks.lock().extend(ticks);
            Ok(count)
        }

        fn location(&self) -> String {
            "memory".to_string()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
            0.0,
            Duration::from_secs(60),
        )
    }

    fn engine(source: Arc<ScriptedSource>, store: Arc<MemoryStore>) -> BackfillEngine {
        BackfillEngine::new(source, Arc::new(NoThrottle), store, fast_retry())
    }

    #[test]
    fn find_last_valid_skips_malformed_newest_rows() {
        let values = [None, None, Some(T), Some(T - 60)];
        assert_eq!(find_last_valid(&values, 10), Lookback::Found(T));
        assert_eq!(find_last_valid(&values, 2), Lookback::NotFound);
        assert_eq!(find_last_valid(&[], 10), Lookback::NotFound);
    }

    #[test]
    fn up_to_date_threshold_is_one_minute() {
        assert!(is_up_to_date(T, T + 59));
        assert!(!is_up_to_date(T, T + 60));
    }

    #[test]
    fn short_gap_plans_a_single_batch() {
        assert_eq!(
            plan_batches(T, T + 2_500),
            vec![FetchRange {
                from: T + 60,
                to: T + 2_500
            }]
        );
    }

    #[test]
    fn long_gap_is_split_into_day_sized_batches() {
        let day = BATCH_SIZE_MINUTES * SECONDS_PER_MINUTE;
        let batches = plan_batches(T, T + 3 * day);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].from, T + 60);
        assert!(batches.iter().all(|range| range.width_secs() <= day));
        assert!(batches
            .windows(2)
            .all(|pair| pair[1].from == pair[0].to + SECONDS_PER_MINUTE));
        assert_eq!(batches[2].to, T + 3 * day);
    }

    #[tokio::test]
    async fn fills_a_short_gap_with_one_fetch() {
        let source = ScriptedSource::minutely();
        let store = MemoryStore::with_last(T);
        let engine = engine(Arc::clone(&source), Arc::clone(&store));

        let report = engine
            .run_at(T + 2_500, &CancellationToken::new())
            .await
            .expect("backfill should succeed");

        assert_eq!(
            source.calls(),
            vec![FetchRange {
                from: T + 60,
                to: T + 2_500
            }]
        );
        assert_eq!(report.batches_planned, 1);
        assert_eq!(report.batches_failed, 0);
        assert_eq!(report.records_appended, 41);
        assert_eq!(store.timestamps().last().copied(), Some(T + 2_460));
    }

    #[tokio::test]
    async fn second_run_against_unchanged_source_appends_nothing() {
        let source = ScriptedSource::minutely();
        let store = MemoryStore::with_last(T);
        let engine = engine(Arc::clone(&source), Arc::clone(&store));
        let cancel = CancellationToken::new();

        engine.run_at(T + 2_500, &cancel).await.expect("first run");
        let second = engine.run_at(T + 2_500, &cancel).await.expect("second run");

        assert!(second.up_to_date);
        assert_eq!(second.records_appended, 0);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_skipped_and_the_rest_are_written() {
        let day = BATCH_SIZE_MINUTES * SECONDS_PER_MINUTE;
        let failing_from = T + day + 120;
        let source = ScriptedSource::new(move |range| {
            if range.from == failing_from {
                return Err(AppError::TransientFetch("status 503".to_string()));
            }
            Ok(vec![
                RawPricePoint(range.from as f64, 41_000.0),
                RawPricePoint((range.to - 60) as f64, 41_500.0),
            ])
        });
        let store = MemoryStore::with_last(T);
        let engine = engine(Arc::clone(&source), Arc::clone(&store));

        let report = engine
            .run_at(T + 3 * day, &CancellationToken::new())
            .await
            .expect("run should complete despite one failed batch");

        assert_eq!(report.batches_planned, 3);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.records_appended, 4);
        let failing_calls = source
            .calls()
            .iter()
            .filter(|range| range.from == failing_from)
            .count();
        assert_eq!(failing_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_batch_waits_out_every_cooldown_then_fails() {
        let source = ScriptedSource::new(|_| Err(AppError::RateLimited));
        let store = MemoryStore::with_last(T);
        let engine = engine(Arc::clone(&source), Arc::clone(&store));
        let started = tokio::time::Instant::now();

        let report = engine
            .run_at(T + 600, &CancellationToken::new())
            .await
            .expect("a failed batch does not fail the run");

        assert_eq!(report.batches_planned, 1);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.records_appended, 0);
        assert_eq!(source.calls().len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(180));
        assert_eq!(store.timestamps(), vec![T]);
    }

    /// Minutely prices returned after a delay, so overlapping runs both plan
    /// from the same resume point.
    struct SlowMinutelySource;

    #[async_trait]
    impl PriceSource for SlowMinutelySource {
        async fn fetch_range(&self, range: FetchRange) -> Result<Vec<RawPricePoint>, AppError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok((range.from..range.to)
                .step_by(SECONDS_PER_MINUTE as usize)
                .map(|ts| RawPricePoint(ts as f64, 40_000.0))
                .collect())
        }
    }

    #[tokio::test]
    async fn overlapping_runs_on_one_csv_store_write_each_minute_once() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("pi-cycle-backfill-overlap-{nanos}.csv"));
        let store = Arc::new(
            CsvTickStore::new(&path, LockOptions::default()).expect("temp dir should exist"),
        );
        store
            .append(vec![Tick::from_price(T, 39_000.0)])
            .await
            .expect("seed append should succeed");

        let first = BackfillEngine::new(
            Arc::new(SlowMinutelySource),
            Arc::new(NoThrottle),
            store.clone(),
            fast_retry(),
        );
        let second = BackfillEngine::new(
            Arc::new(SlowMinutelySource),
            Arc::new(NoThrottle),
            store.clone(),
            fast_retry(),
        );

        let cancel = CancellationToken::new();
        let (first_report, second_report) =
            tokio::join!(first.run_at(T + 600, &cancel), second.run_at(T + 600, &cancel));
        let first_report = first_report.expect("first run should succeed");
        let second_report = second_report.expect("second run should succeed");

        assert_eq!(first_report.last_timestamp, T);
        assert_eq!(second_report.last_timestamp, T);
        assert_eq!(
            first_report.records_appended + second_report.records_appended,
            9
        );

        let tail = store.tail_timestamps(20).await.expect("tail read should succeed");
        let expected: Vec<Option<i64>> = (0..=9).rev().map(|minute| Some(T + minute * 60)).collect();
        assert_eq!(tail, expected);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn collected_points_are_filtered_sorted_and_deduplicated() {
        let source = ScriptedSource::new(|_| {
            Ok(vec![
                RawPricePoint((T + 180) as f64 * 1_000.0, 3.0),
                RawPricePoint((T + 60) as f64, 1.0),
                RawPricePoint((T + 180) as f64, 3.5),
                RawPricePoint(T as f64, 0.5),
                RawPricePoint((T - 60) as f64, 0.25),
                RawPricePoint((T + 120) as f64, f64::NAN),
                RawPricePoint((T + 120) as f64 * 1_000.0, 2.0),
            ])
        });
        let store = MemoryStore::with_last(T);
        let engine = engine(source, Arc::clone(&store));

        let report = engine
            .run_at(T + 600, &CancellationToken::new())
            .await
            .expect("backfill should succeed");

        assert_eq!(report.records_appended, 3);
        assert_eq!(store.timestamps(), vec![T, T + 60, T + 120, T + 180]);
        let ticks = store.ticks.lock();
        assert_eq!(ticks[3].close, 3.0);
        assert_eq!(ticks[3].volume, None);
    }

    #[tokio::test]
    async fn cancellation_discards_collected_points() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let source = ScriptedSource::new(move |range| {
            trigger.cancel();
            Ok(vec![RawPricePoint(range.from as f64, 42_000.0)])
        });
        let store = MemoryStore::with_last(T);
        let engine = engine(Arc::clone(&source), Arc::clone(&store));

        let day = BATCH_SIZE_MINUTES * SECONDS_PER_MINUTE;
        let result = engine.run_at(T + 3 * day, &cancel).await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(source.calls().len(), 1);
        assert_eq!(store.timestamps(), vec![T]);
    }

    #[tokio::test]
    async fn empty_and_corrupt_stores_fail_the_run() {
        let empty = Arc::new(MemoryStore::default());
        let engine_on_empty = engine(ScriptedSource::minutely(), empty);
        assert!(matches!(
            engine_on_empty.resume_point().await,
            Err(AppError::EmptyStore(_))
        ));
        assert!(!engine_on_empty.run_backfill(&CancellationToken::new()).await);

        let corrupt = Arc::new(MemoryStore {
            tail_override: Some(vec![None; RESUME_LOOKBACK_RECORDS]),
            ..MemoryStore::default()
        });
        let engine_on_corrupt = engine(ScriptedSource::minutely(), corrupt);
        assert!(matches!(
            engine_on_corrupt.resume_point().await,
            Err(AppError::CorruptStore { lookback: 10, .. })
        ));
    }

    #[tokio::test]
    async fn resume_point_uses_newest_valid_record() {
        let store = Arc::new(MemoryStore {
            tail_override: Some(vec![None, Some(T + 120), Some(T + 60)]),
            ..MemoryStore::default()
        });
        let engine = engine(ScriptedSource::minutely(), store);
        assert_eq!(engine.resume_point().await.expect("valid record"), T + 120);
    }
}
