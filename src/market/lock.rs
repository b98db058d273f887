use crate::error::AppError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error};

const DEFAULT_POLL_INTERVAL_MS: u64 = 25;

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

pub fn marker_path(store_path: &Path) -> PathBuf {
    let mut raw = store_path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

/// Exclusive advisory lock on `<store>.lock`, shared with every process that
/// uses the same marker. Released on drop; `release` surfaces the error
/// instead of only logging it.
#[derive(Debug)]
pub struct ScopedLock {
    file: Option<File>,
    marker: PathBuf,
}

impl ScopedLock {
    /// Blocks the calling thread; run it on the blocking pool from async code.
    pub fn acquire(store_path: &Path, options: &LockOptions) -> Result<Self, AppError> {
        let marker = marker_path(store_path);
        let started_at = Instant::now();

        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&marker)?;

            match options.acquire_timeout {
                None => FileExt::lock_exclusive(&file)?,
                Some(timeout) => {
                    lock_with_deadline(&file, &marker, started_at, timeout, options.poll_interval)?
                }
            }

            // A previous holder unlinks the marker before unlocking, so the
            // file we locked may no longer be the one at the path.
            if is_current_marker(&file, &marker)? {
                debug!(path = %marker.display(), "store lock acquired");
                return Ok(Self {
                    file: Some(file),
                    marker,
                });
            }

            let _ = FileExt::unlock(&file);
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn release(mut self) -> Result<(), AppError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), AppError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let removed = match std::fs::remove_file(&self.marker) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        };
        let unlocked = FileExt::unlock(&file);
        drop(file);

        removed.and(unlocked).map_err(|error| AppError::LockRelease {
            path: self.marker.display().to_string(),
            reason: error.to_string(),
        })
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Err(error) = self.release_inner() {
            error!(%error, "store lock release failed; marker may need manual cleanup");
        }
    }
}

fn lock_with_deadline(
    file: &File,
    marker: &Path,
    started_at: Instant,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), AppError> {
    let contended = fs2::lock_contended_error();
    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(error) if error.raw_os_error() == contended.raw_os_error() => {
                let waited = started_at.elapsed();
                if waited >= timeout {
                    return Err(AppError::LockTimeout {
                        path: marker.display().to_string(),
                        waited_ms: waited.as_millis(),
                    });
                }
                std::thread::sleep(poll_interval.min(timeout - waited));
            }
            Err(error) => return Err(error.into()),
        }
    }
}

#[cfg(unix)]
fn is_current_marker(file: &File, marker: &Path) -> Result<bool, AppError> {
    use std::os::unix::fs::MetadataExt;

    let locked = file.metadata()?;
    match std::fs::metadata(marker) {
        Ok(current) => Ok(current.dev() == locked.dev() && current.ino() == locked.ino()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}

#[cfg(not(unix))]
fn is_current_marker(_file: &File, marker: &Path) -> Result<bool, AppError> {
    Ok(marker.exists())
}
