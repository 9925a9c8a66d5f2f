//! Binance public API client for market data (no authentication required)

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::MarketDataClient;
use crate::types::Kline;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

impl BinanceClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into(),
        })
    }

    /// Fetch the latest `limit` klines for a symbol
    pub async fn fetch_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        debug!(symbol, interval, limit, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let raw_klines: Vec<RawKline> = response.json().await?;
        let klines: Vec<Kline> = raw_klines.into_iter().filter_map(parse_kline).collect();

        debug!(count = klines.len(), "Fetched klines");
        Ok(klines)
    }

    /// Current ticker price for a symbol
    pub async fn fetch_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let ticker: TickerPrice = response.json().await?;
        Ok(Decimal::from_str(&ticker.price)?)
    }
}

fn parse_kline(raw: RawKline) -> Option<Kline> {
    Some(Kline {
        open_time: raw.0,
        open: Decimal::from_str(&raw.1).ok()?,
        high: Decimal::from_str(&raw.2).ok()?,
        low: Decimal::from_str(&raw.3).ok()?,
        close: Decimal::from_str(&raw.4).ok()?,
        volume: Decimal::from_str(&raw.5).ok()?,
        close_time: raw.6,
    })
}

#[async_trait]
impl MarketDataClient for BinanceClient {
    async fn get_price(&self, symbol: &str) -> Option<Decimal> {
        match self.fetch_price(symbol).await {
            Ok(price) if price > Decimal::ZERO => Some(price),
            Ok(price) => {
                warn!(symbol, %price, "Ignoring non-positive ticker price");
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "Price fetch failed");
                None
            }
        }
    }

    async fn get_window(&self, symbol: &str, interval: &str, bars: usize) -> Option<Vec<Kline>> {
        match self.fetch_klines(symbol, interval, bars).await {
            Ok(klines) if !klines.is_empty() => Some(klines),
            Ok(_) => None,
            Err(e) => {
                warn!(symbol, interval, error = %e, "Kline fetch failed");
                None
            }
        }
    }
}
