//! Market data sources

pub mod binance;

pub use binance::BinanceClient;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::Kline;

/// Price and candle source for signal generation and bootstrap simulation.
///
/// `None` means the data is not available right now. Callers treat that as
/// insufficient data and never substitute placeholder values.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Option<Decimal>;

    /// The most recent `bars` closed candles, oldest first
    async fn get_window(&self, symbol: &str, interval: &str, bars: usize) -> Option<Vec<Kline>>;
}
