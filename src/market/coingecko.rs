use crate::error::AppError;
use crate::market::types::{parse_range_payload, FetchRange, RawPricePoint};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

pub const COINGECKO_RANGE_URL: &str =
    "https://api.coingecko.com/api/v3/coins/bitcoin/market_chart/range";

/// Historical range query against an external price source.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// One request for `range`. Points come back exactly as the source sent
    /// them; callers normalize timestamps.
    async fn fetch_range(&self, range: FetchRange) -> Result<Vec<RawPricePoint>, AppError>;
}

#[derive(Debug, Clone)]
pub struct CoinGeckoRangeSource {
    client: Client,
    endpoint: String,
}

impl CoinGeckoRangeSource {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

fn range_endpoint(base_url: &str, range: FetchRange) -> String {
    format!(
        "{base_url}?vs_currency=usd&from={}&to={}",
        range.from, range.to
    )
}

/// Maps an HTTP status and body onto the fetch error taxonomy.
pub fn classify_range_response(
    status: u16,
    body: &mut [u8],
) -> Result<Vec<RawPricePoint>, AppError> {
    if status == 429 {
        return Err(AppError::RateLimited);
    }
    if !(200..300).contains(&status) {
        return Err(AppError::TransientFetch(format!(
            "range source returned status {status}"
        )));
    }
    parse_range_payload(body)
}

#[async_trait]
impl PriceSource for CoinGeckoRangeSource {
    async fn fetch_range(&self, range: FetchRange) -> Result<Vec<RawPricePoint>, AppError> {
        let endpoint = range_endpoint(&self.endpoint, range);
        debug!(from = range.from, to = range.to, "requesting price range");

        let response = self.client.get(endpoint).send().await?;
        let status = response.status().as_u16();
        let mut body = response.bytes().await?.to_vec();
        classify_range_response(status, &mut body)
    }
}
