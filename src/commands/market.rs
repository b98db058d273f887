use crate::market::types::MovingAverages;
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatestPriceResponse {
    pub price: Option<f64>,
    pub timestamp: Option<i64>,
}

pub fn latest_price(state: &AppState) -> LatestPriceResponse {
    let latest = *state.latest_price.read();
    LatestPriceResponse {
        price: latest.map(|observed| observed.price),
        timestamp: latest.map(|observed| observed.timestamp),
    }
}

/// `None` fields until the long window has filled.
pub fn latest_moving_averages(state: &AppState) -> MovingAverages {
    state.averager.lock().moving_averages()
}
