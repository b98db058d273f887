use crate::error::AppError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const SPOT_REQUEST_TIMEOUT_MS: u64 = 5_000;

const CRYPTOCOMPARE_PRICE_URL: &str = "https://min-api.cryptocompare.com/data/price";
const COINGECKO_SIMPLE_PRICE_URL: &str = "https://api.coingecko.com/api/v3/simple/price";
const BINANCE_TICKER_PRICE_URL: &str = "https://api.binance.com/api/v3/ticker/price";
const BITFINEX_TICKER_URL: &str = "https://api-pub.bitfinex.com/v2/ticker/tBTCUSD";
const BITFINEX_LAST_PRICE_INDEX: usize = 6;

/// Latest BTC/USD price for the live tick loop.
#[async_trait]
pub trait SpotPriceSource: Send + Sync {
    async fn latest_price(&self) -> Result<f64, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotProvider {
    CryptoCompare,
    CoinGecko,
    Binance,
    Bitfinex,
}

impl SpotProvider {
    pub const DEFAULT_ORDER: [SpotProvider; 4] = [
        SpotProvider::CryptoCompare,
        SpotProvider::CoinGecko,
        SpotProvider::Binance,
        SpotProvider::Bitfinex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CryptoCompare => "cryptocompare",
            Self::CoinGecko => "coingecko",
            Self::Binance => "binance",
            Self::Bitfinex => "bitfinex",
        }
    }

    fn endpoint(self) -> String {
        match self {
            Self::CryptoCompare => format!("{CRYPTOCOMPARE_PRICE_URL}?fsym=BTC&tsyms=USD"),
            Self::CoinGecko => {
                format!("{COINGECKO_SIMPLE_PRICE_URL}?ids=bitcoin&vs_currencies=usd")
            }
            Self::Binance => format!("{BINANCE_TICKER_PRICE_URL}?symbol=BTCUSDT"),
            Self::Bitfinex => BITFINEX_TICKER_URL.to_string(),
        }
    }

    fn parse_price(self, payload: &mut [u8]) -> Result<f64, AppError> {
        let price = match self {
            Self::CryptoCompare => {
                let wire: CryptoCompareWire = simd_json::serde::from_slice(payload)?;
                wire.usd
            }
            Self::CoinGecko => {
                let wire: CoinGeckoSimpleWire = simd_json::serde::from_slice(payload)?;
                wire.bitcoin.usd
            }
            Self::Binance => {
                let wire: BinanceTickerWire = simd_json::serde::from_slice(payload)?;
                wire.price.parse::<f64>()?
            }
            Self::Bitfinex => {
                let wire: Vec<f64> = simd_json::serde::from_slice(payload)?;
                wire.get(BITFINEX_LAST_PRICE_INDEX).copied().ok_or_else(|| {
                    AppError::InvalidArgument("bitfinex ticker is missing last price".to_string())
                })?
            }
        };

        if !price.is_finite() || price <= 0.0 {
            return Err(AppError::InvalidArgument(format!(
                "{} returned a non-positive or non-finite price",
                self.as_str()
            )));
        }
        Ok(price)
    }
}

#[derive(Debug, Deserialize)]
struct CryptoCompareWire {
    #[serde(rename = "USD")]
    usd: f64,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoSimpleWire {
    bitcoin: CoinGeckoUsdWire,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoUsdWire {
    usd: f64,
}

#[derive(Debug, Deserialize)]
struct BinanceTickerWire {
    price: String,
}

/// Asks each provider in order and returns the first valid price.
#[derive(Debug, Clone)]
pub struct FallbackSpotSource {
    client: Client,
    providers: Vec<SpotProvider>,
    request_timeout: Duration,
}

impl FallbackSpotSource {
    pub fn new(client: Client, providers: Vec<SpotProvider>) -> Self {
        Self {
            client,
            providers,
            request_timeout: Duration::from_millis(SPOT_REQUEST_TIMEOUT_MS),
        }
    }

    async fn fetch_from(&self, provider: SpotProvider) -> Result<f64, AppError> {
        let response = self
            .client
            .get(provider.endpoint())
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        let mut payload = response.bytes().await?.to_vec();
        provider.parse_price(&mut payload)
    }
}

#[async_trait]
impl SpotPriceSource for FallbackSpotSource {
    async fn latest_price(&self) -> Result<f64, AppError> {
        for provider in &self.providers {
            match self.fetch_from(*provider).await {
                Ok(price) => {
                    debug!(provider = provider.as_str(), price, "spot price fetched");
                    return Ok(price);
                }
                Err(error) => {
                    warn!(provider = provider.as_str(), %error, "spot price source failed");
                }
            }
        }
        Err(AppError::AllSourcesFailed)
    }
}
