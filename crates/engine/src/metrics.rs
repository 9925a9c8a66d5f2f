//! Trade statistics
//!
//! Turns a list of closed trades into the `StatsSnapshot` the fitness
//! evaluator scores. Used by the bootstrap simulation and for live stats
//! recomputed from reported fills.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::{StatsSnapshot, TradeRecord};

/// Profit factor reported when there are profits and no losses
pub const PROFIT_FACTOR_CAP: f64 = 999.99;

/// Realized result of one closed trade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeOutcome {
    pub pnl: Decimal,
    /// Percent return of the position (2.5 = +2.5%)
    pub pnl_pct: f64,
}

impl From<&TradeRecord> for TradeOutcome {
    fn from(trade: &TradeRecord) -> Self {
        Self {
            pnl: trade.pnl,
            pnl_pct: trade.pnl_pct,
        }
    }
}

/// Compute stats over trades in closing order, relative to `base_capital`.
/// Drawdown is measured on the realized equity curve.
pub fn compute_stats(outcomes: &[TradeOutcome], base_capital: Decimal) -> StatsSnapshot {
    let trade_count = outcomes.len() as i64;
    if outcomes.is_empty() || base_capital <= Decimal::ZERO {
        return StatsSnapshot {
            trade_count,
            ..Default::default()
        };
    }

    let wins = outcomes.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let win_rate = wins as f64 / outcomes.len() as f64;

    let total_pnl: Decimal = outcomes.iter().map(|t| t.pnl).sum();
    let total_return = (total_pnl / base_capital).to_f64().unwrap_or(0.0);

    let gross_profits: Decimal = outcomes
        .iter()
        .filter(|t| t.pnl > Decimal::ZERO)
        .map(|t| t.pnl)
        .sum();
    let gross_losses: Decimal = outcomes
        .iter()
        .filter(|t| t.pnl < Decimal::ZERO)
        .map(|t| t.pnl.abs())
        .sum();
    let profit_factor = profit_factor(gross_profits, gross_losses);

    let mut equity = base_capital;
    let mut peak = base_capital;
    let mut max_drawdown = 0.0_f64;
    for outcome in outcomes {
        equity += outcome.pnl;
        if equity > peak {
            peak = equity;
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
            max_drawdown = max_drawdown.max(dd);
        }
    }

    let returns: Vec<f64> = outcomes.iter().map(|t| t.pnl_pct).collect();

    StatsSnapshot {
        win_rate,
        total_return,
        sharpe_ratio: sharpe_ratio(&returns),
        max_drawdown: max_drawdown.clamp(0.0, 1.0),
        profit_factor,
        trade_count,
    }
}

/// Stats from reported fills. The base is the strategy's allocation, or the
/// largest position it has taken when that is bigger.
pub fn live_stats(trades: &[TradeRecord], allocation: Option<Decimal>) -> StatsSnapshot {
    let largest_notional = trades
        .iter()
        .map(|t| t.entry_price * t.quantity)
        .max()
        .unwrap_or(Decimal::ZERO);
    let base = allocation.unwrap_or(Decimal::ZERO).max(largest_notional);

    let outcomes: Vec<TradeOutcome> = trades.iter().map(TradeOutcome::from).collect();
    compute_stats(&outcomes, base)
}

fn profit_factor(gross_profits: Decimal, gross_losses: Decimal) -> f64 {
    if gross_losses > Decimal::ZERO {
        (gross_profits / gross_losses)
            .to_f64()
            .unwrap_or(0.0)
            .min(PROFIT_FACTOR_CAP)
    } else if gross_profits > Decimal::ZERO {
        PROFIT_FACTOR_CAP
    } else {
        0.0
    }
}

/// Per-trade Sharpe: mean return over sample standard deviation
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    if std_dev < 1e-10 || !std_dev.is_finite() {
        return 0.0;
    }
    mean / std_dev
}
