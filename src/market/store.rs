use crate::error::AppError;
use crate::market::lock::{LockOptions, ScopedLock};
use crate::market::types::{Tick, RESUME_LOOKBACK_RECORDS};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TAIL_CHUNK_BYTES: u64 = 8 * 1024;
const TIMESTAMP_COLUMN: &str = "Timestamp";

/// Append-only persisted tick series.
#[async_trait]
pub trait TickStore: Send + Sync {
    /// Timestamps of up to `max_records` trailing records, newest first.
    /// `None` marks a record whose timestamp did not parse.
    async fn tail_timestamps(&self, max_records: usize) -> Result<Vec<Option<i64>>, AppError>;

    /// Appends `ticks` in the given order as one locked write. Ticks at or
    /// before the newest persisted timestamp are dropped under the lock.
    /// Returns the number of records written.
    async fn append(&self, ticks: Vec<Tick>) -> Result<usize, AppError>;

    fn location(&self) -> String;
}

/// CSV store guarded by a `<path>.lock` advisory lock for every write.
#[derive(Debug, Clone)]
pub struct CsvTickStore {
    path: PathBuf,
    lock_options: LockOptions,
}

impl CsvTickStore {
    pub fn new(path: impl Into<PathBuf>, lock_options: LockOptions) -> Result<Self, AppError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(AppError::Configuration(format!(
                    "directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        Ok(Self { path, lock_options })
    }

    /// Typical prices of the last `count` well-formed records, oldest first.
    pub async fn recent_typical_prices(&self, count: usize) -> Result<Vec<f64>, AppError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_recent_typical_prices(&path, count)).await?
    }
}

#[async_trait]
impl TickStore for CsvTickStore {
    async fn tail_timestamps(&self, max_records: usize) -> Result<Vec<Option<i64>>, AppError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_tail_timestamps(&path, max_records)).await?
    }

    async fn append(&self, ticks: Vec<Tick>) -> Result<usize, AppError> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let path = self.path.clone();
        let lock_options = self.lock_options.clone();
        tokio::task::spawn_blocking(move || {
            let lock = ScopedLock::acquire(&path, &lock_options)?;
            append_locked(lock, &path, &ticks)
        })
        .await?
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Writes while `lock` is held, then releases it. A failed release after a
/// committed write is logged and the write still counts.
fn append_locked(lock: ScopedLock, path: &Path, ticks: &[Tick]) -> Result<usize, AppError> {
    let written = write_new_ticks(path, ticks);
    if let Err(error) = lock.release() {
        warn!(%error, "store lock release failed");
    }
    let written = written?;
    info!(path = %path.display(), written, "appended ticks to store");
    Ok(written)
}

/// Re-reads the newest persisted timestamp under the caller's lock and writes
/// only the ticks after it, in strictly increasing order.
fn write_new_ticks(path: &Path, ticks: &[Tick]) -> Result<usize, AppError> {
    let newest = read_tail_timestamps(path, RESUME_LOOKBACK_RECORDS)?
        .into_iter()
        .flatten()
        .next();

    let mut last = newest;
    let fresh: Vec<Tick> = ticks
        .iter()
        .filter(|tick| {
            let keep = last.map_or(true, |last| tick.timestamp > last);
            if keep {
                last = Some(tick.timestamp);
            }
            keep
        })
        .cloned()
        .collect();

    let skipped = ticks.len() - fresh.len();
    if skipped > 0 {
        warn!(skipped, ?newest, "dropped ticks already covered by the store");
    }
    if fresh.is_empty() {
        return Ok(0);
    }
    write_ticks(path, &fresh)
}

fn write_ticks(path: &Path, ticks: &[Tick]) -> Result<usize, AppError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let is_empty = file.metadata()?.len() == 0;
    if !is_empty && !ends_with_newline(&mut file)? {
        file.write_all(b"\n")?;
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(is_empty)
        .from_writer(&mut file);
    for tick in ticks {
        writer.serialize(tick)?;
    }
    writer.flush()?;
    drop(writer);

    file.sync_data()?;
    Ok(ticks.len())
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn read_tail_timestamps(path: &Path, max_records: usize) -> Result<Vec<Option<i64>>, AppError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let mut header = String::new();
    let header_len = BufReader::new(&mut file).read_line(&mut header)? as u64;
    if header_len == 0 || max_records == 0 {
        return Ok(Vec::new());
    }

    let columns: Vec<&str> = header.trim_end().split(',').collect();
    let column = columns
        .iter()
        .position(|name| name.trim() == TIMESTAMP_COLUMN)
        .unwrap_or(0);

    let lines = read_tail_lines(&mut file, header_len, max_records)?;
    debug!(path = %path.display(), records = lines.len(), "read store tail");

    Ok(lines
        .iter()
        .map(|line| parse_record_timestamp(line, column, columns.len()))
        .collect())
}

/// A record cut short by an interrupted write has fewer fields than the
/// header and is treated as unreadable even if its prefix parses.
fn parse_record_timestamp(line: &str, column: usize, expected_fields: usize) -> Option<i64> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != expected_fields {
        return None;
    }
    fields.get(column).copied().and_then(parse_timestamp_field)
}

/// Last `max_lines` non-blank lines after `data_start`, newest first.
fn read_tail_lines(file: &mut File, data_start: u64, max_lines: usize) -> io::Result<Vec<String>> {
    let end = file.seek(SeekFrom::End(0))?;
    let mut position = end;
    let mut buffer: Vec<u8> = Vec::new();

    while position > data_start {
        let chunk = TAIL_CHUNK_BYTES.min(position - data_start);
        position -= chunk;
        file.seek(SeekFrom::Start(position))?;

        let mut block = vec![0_u8; chunk as usize];
        file.read_exact(&mut block)?;
        block.extend_from_slice(&buffer);
        buffer = block;

        if complete_non_blank_lines(&buffer) >= max_lines {
            break;
        }
    }

    // Everything before the first newline may be the tail of a longer line.
    if position > data_start {
        let cut = buffer
            .iter()
            .position(|byte| *byte == b'\n')
            .map_or(buffer.len(), |newline| newline + 1);
        buffer.drain(..cut);
    }

    let text = String::from_utf8_lossy(&buffer);
    Ok(text
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(max_lines)
        .map(str::to_string)
        .collect())
}

fn complete_non_blank_lines(buffer: &[u8]) -> usize {
    buffer
        .split(|byte| *byte == b'\n')
        .skip(1)
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count()
}

/// Accepts integer seconds and float-formatted seconds such as `1325317920.0`.
fn parse_timestamp_field(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| value as i64)
}

/// Price columns only; historical files may carry float timestamps.
#[derive(Debug, Deserialize)]
struct StoredPriceWire {
    #[serde(rename = "Open")]
    open: f64,
    #[serde(rename = "High")]
    high: f64,
    #[serde(rename = "Low")]
    low: f64,
    #[serde(rename = "Close")]
    close: f64,
}

impl StoredPriceWire {
    fn into_tick(self) -> Tick {
        Tick {
            timestamp: 0,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: None,
        }
    }
}

fn read_recent_typical_prices(path: &Path, count: usize) -> Result<Vec<f64>, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut recent: VecDeque<f64> = VecDeque::with_capacity(count.min(1 << 20));
    let mut skipped = 0_usize;
    for record in reader.deserialize::<StoredPriceWire>() {
        let price = match record {
            Ok(wire) => wire.into_tick().typical_price(),
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        if !price.is_finite() {
            skipped += 1;
            continue;
        }
        if recent.len() == count {
            recent.pop_front();
        }
        if count > 0 {
            recent.push_back(price);
        }
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped malformed store records");
    }
    Ok(recent.into_iter().collect())
}
