//! Bar-by-bar bootstrap simulation
//!
//! Replays an archetype over a market window, long-only, and reports the
//! stats a freshly bred candidate is first scored on.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::debug;

use crate::archetypes::{price_bars, SignalAction, SignalError, StrategyArchetype};
use crate::metrics::{compute_stats, TradeOutcome};
use crate::types::{Kline, Parameters, StatsSnapshot};

#[derive(Debug, Error, PartialEq)]
pub enum SimulationError {
    #[error("Insufficient data: need {needed} bars, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Signal error: {0}")]
    Signal(SignalError),
}

impl From<SignalError> for SimulationError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::InsufficientData { needed, available } => {
                SimulationError::InsufficientData { needed, available }
            }
            other => SimulationError::Signal(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub initial_capital: Decimal,
    /// Percent of equity committed per position
    pub position_size_pct: Decimal,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            position_size_pct: dec!(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub stats: StatsSnapshot,
    pub bars: usize,
    pub final_equity: Decimal,
}

struct OpenPosition {
    entry_price: Decimal,
    size: Decimal,
}

impl OpenPosition {
    fn close(self, exit_price: Decimal) -> TradeOutcome {
        let pnl = (exit_price - self.entry_price) * self.size;
        let pnl_pct = if self.entry_price > Decimal::ZERO {
            ((exit_price - self.entry_price) / self.entry_price * dec!(100))
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        TradeOutcome { pnl, pnl_pct }
    }
}

pub struct Simulator;

impl Simulator {
    pub fn run(
        archetype: &dyn StrategyArchetype,
        params: &Parameters,
        klines: &[Kline],
        config: &SimulationConfig,
    ) -> Result<SimulationReport, SimulationError> {
        // Need at least one tradable bar after warmup
        let needed = archetype.warmup_bars(params)? + 1;
        if klines.len() < needed {
            return Err(SimulationError::InsufficientData {
                needed,
                available: klines.len(),
            });
        }

        let bars = price_bars(klines)?;
        let mut generator = archetype.signal_generator(params)?;
        let hundred = dec!(100);

        let mut equity = config.initial_capital;
        let mut peak_equity = equity;
        let mut max_drawdown = 0.0_f64;
        let mut position: Option<OpenPosition> = None;
        let mut outcomes: Vec<TradeOutcome> = Vec::new();

        for (kline, bar) in klines.iter().zip(&bars) {
            let signal = generator.on_bar(bar);

            match signal.action {
                SignalAction::Buy => {
                    if position.is_none() && kline.close > Decimal::ZERO {
                        let position_value = equity * config.position_size_pct / hundred;
                        position = Some(OpenPosition {
                            entry_price: kline.close,
                            size: position_value / kline.close,
                        });
                    }
                }
                SignalAction::Sell => {
                    if let Some(pos) = position.take() {
                        let outcome = pos.close(kline.close);
                        equity += outcome.pnl;
                        outcomes.push(outcome);
                    }
                }
                SignalAction::Hold => {}
            }

            // Mark to market
            let unrealized = position
                .as_ref()
                .map(|p| (kline.close - p.entry_price) * p.size)
                .unwrap_or(Decimal::ZERO);
            let current_equity = equity + unrealized;
            if current_equity > peak_equity {
                peak_equity = current_equity;
            }
            if peak_equity > Decimal::ZERO {
                let dd = ((peak_equity - current_equity) / peak_equity)
                    .to_f64()
                    .unwrap_or(0.0);
                max_drawdown = max_drawdown.max(dd);
            }
        }

        // Close any remaining position at the last bar
        if let (Some(pos), Some(last)) = (position.take(), klines.last()) {
            let outcome = pos.close(last.close);
            equity += outcome.pnl;
            outcomes.push(outcome);
        }

        let mut stats = compute_stats(&outcomes, config.initial_capital);
        stats.max_drawdown = stats.max_drawdown.max(max_drawdown).clamp(0.0, 1.0);

        debug!(
            archetype = %archetype.kind(),
            bars = klines.len(),
            trades = stats.trade_count,
            win_rate = stats.win_rate,
            total_return = stats.total_return,
            "Simulation complete"
        );

        Ok(SimulationReport {
            stats,
            bars: klines.len(),
            final_equity: equity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetypes::ArchetypeRegistry;
    use crate::types::ArchetypeKind;

    fn make_klines(prices: &[f64]) -> Vec<Kline> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
                Kline {
                    open_time: (i as i64) * 60000,
                    open: price,
                    high: price + dec!(1),
                    low: price - dec!(1),
                    close: price,
                    volume: dec!(100),
                    close_time: ((i + 1) as i64) * 60000 - 1,
                }
            })
            .collect()
    }

    fn rsi_params() -> Parameters {
        [("period", 14.0), ("overbought", 70.0), ("oversold", 30.0)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_empty_window_is_insufficient_data() {
        let registry = ArchetypeRegistry::with_defaults();
        let archetype = registry.get(ArchetypeKind::RsiReversal).unwrap();
        let err = Simulator::run(archetype.as_ref(), &rsi_params(), &[], &SimulationConfig::default())
            .unwrap_err();
        assert_eq!(err, SimulationError::InsufficientData { needed: 16, available: 0 });
    }

    #[test]
    fn test_down_then_up_produces_a_winning_trade() {
        let mut prices = Vec::new();
        for i in 0..20 {
            prices.push(100.0 - (i as f64) * 2.0);
        }
        for i in 0..20 {
            prices.push(60.0 + (i as f64) * 3.0);
        }

        let registry = ArchetypeRegistry::with_defaults();
        let archetype = registry.get(ArchetypeKind::RsiReversal).unwrap();
        let report = Simulator::run(
            archetype.as_ref(),
            &rsi_params(),
            &make_klines(&prices),
            &SimulationConfig::default(),
        )
        .unwrap();

        assert_eq!(report.bars, 40);
        assert!(report.stats.trade_count >= 1);
        assert!(report.stats.total_return > 0.0);
        assert!(report.final_equity > dec!(10000));
        assert!((0.0..=1.0).contains(&report.stats.max_drawdown));
    }

    #[test]
    fn test_flat_market_has_no_trades() {
        let registry = ArchetypeRegistry::with_defaults();
        let archetype = registry.get(ArchetypeKind::RsiReversal).unwrap();
        let report = Simulator::run(
            archetype.as_ref(),
            &rsi_params(),
            &make_klines(&[100.0; 60]),
            &SimulationConfig::default(),
        )
        .unwrap();
        assert_eq!(report.stats.trade_count, 0);
        assert_eq!(report.final_equity, dec!(10000));
    }
}
