//! Fakes shared by the engine and scheduler tests

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use crate::account::PaperAccount;
use crate::api::MarketDataClient;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::store::MemoryStore;
use crate::types::{ArchetypeKind, Kline, Parameters, StrategyRecord};

pub(crate) fn make_klines(prices: &[f64]) -> Vec<Kline> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
            Kline {
                open_time: (i as i64) * 900_000,
                open: price,
                high: price + dec!(0.5),
                low: price - dec!(0.5),
                close: price,
                volume: dec!(100),
                close_time: ((i + 1) as i64) * 900_000 - 1,
            }
        })
        .collect()
}

/// Market that serves the tail of a fixed price path for every symbol
pub(crate) struct SyntheticMarket {
    klines: Vec<Kline>,
    prices: bool,
    delay: Duration,
}

impl SyntheticMarket {
    /// Slow drift with a wave on top, enough for every archetype to trade
    pub fn new() -> Self {
        let prices: Vec<f64> = (0..600)
            .map(|i| {
                let t = i as f64;
                100.0 + 0.02 * t + 8.0 * (t / 9.0).sin() + 3.0 * (t / 3.7).cos()
            })
            .collect();
        Self::from_prices(&prices)
    }

    pub fn empty() -> Self {
        Self::from_prices(&[])
    }

    /// Flat tape that rallies hard on the final bars
    pub fn breakout_up() -> Self {
        let mut prices = vec![100.0; 200];
        prices.extend((1..=30).map(|i| 100.0 * 1.01_f64.powi(i)));
        Self::from_prices(&prices)
    }

    fn from_prices(prices: &[f64]) -> Self {
        Self {
            klines: make_klines(prices),
            prices: true,
            delay: Duration::ZERO,
        }
    }

    pub fn without_prices(mut self) -> Self {
        self.prices = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl MarketDataClient for SyntheticMarket {
    async fn get_price(&self, _symbol: &str) -> Option<Decimal> {
        if !self.prices {
            return None;
        }
        self.klines.last().map(|k| k.close)
    }

    async fn get_window(&self, _symbol: &str, _interval: &str, bars: usize) -> Option<Vec<Kline>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.klines.is_empty() {
            return None;
        }
        let start = self.klines.len().saturating_sub(bars);
        Some(self.klines[start..].to_vec())
    }
}

pub(crate) fn engine_with(
    store: Arc<MemoryStore>,
    market: Arc<SyntheticMarket>,
    capital: Decimal,
) -> Engine {
    Engine::with_paper_account(
        EngineConfig::default(),
        store,
        market,
        Arc::new(PaperAccount::new(capital)),
    )
    .with_seed(7)
}

pub(crate) fn momentum_record(id: &str, symbol: &str) -> StrategyRecord {
    let mut params = Parameters::new();
    params.insert("lookback".to_string(), 20.0);
    params.insert("entry_threshold".to_string(), 1.5);
    StrategyRecord::candidate(
        id.to_string(),
        ArchetypeKind::Momentum,
        symbol.to_string(),
        params,
        0,
        Vec::new(),
    )
}
