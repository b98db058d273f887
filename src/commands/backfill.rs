use crate::error::AppError;
use crate::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Newest persisted timestamp, or `None` when the store cannot provide one.
pub async fn resume_point(state: &AppState) -> Option<i64> {
    match state.backfill.resume_point().await {
        Ok(timestamp) => Some(timestamp),
        Err(AppError::EmptyStore(_)) => None,
        Err(error) => {
            warn!(%error, "resume point unavailable");
            None
        }
    }
}

pub async fn run_backfill(state: &AppState, cancel: &CancellationToken) -> bool {
    state.backfill.run_backfill(cancel).await
}
