use crate::market::types::ServiceState;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: ServiceState,
    pub uptime_ms: u128,
    pub window_len: usize,
    pub window_warm: bool,
}

pub fn build_health_response(
    started_at: Instant,
    status: ServiceState,
    window_len: usize,
    window_warm: bool,
) -> HealthResponse {
    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        window_len,
        window_warm,
    }
}

pub fn health(state: &AppState) -> HealthResponse {
    let (window_len, window_warm) = {
        let averager = state.averager.lock();
        (averager.len(), averager.is_warm())
    };
    build_health_response(state.started_at, state.status(), window_len, window_warm)
}
