//! Fitness scoring
//!
//! Maps a `StatsSnapshot` to a bounded 0–100 score. Each metric goes through
//! a steep piecewise-linear ramp so mediocre stats land well below the
//! qualification line and only strong, low-drawdown, high-Sharpe strategies
//! approach the top of the scale.

use serde::Serialize;

use crate::types::StatsSnapshot;

const WIN_RATE_WEIGHT: f64 = 0.30;
const RETURN_WEIGHT: f64 = 0.25;
const SHARPE_WEIGHT: f64 = 0.20;
const DRAWDOWN_WEIGHT: f64 = 0.15;
const PROFIT_FACTOR_WEIGHT: f64 = 0.10;

/// Maximum points removed for a thin sample
const SAMPLE_PENALTY_MAX: f64 = 30.0;
/// Maximum points removed for over-trading
const OVERTRADING_PENALTY_MAX: f64 = 10.0;

const WIN_RATE_POINTS: &[(f64, f64)] = &[
    (0.40, 0.0),
    (0.50, 15.0),
    (0.55, 30.0),
    (0.60, 50.0),
    (0.65, 70.0),
    (0.70, 85.0),
    (0.80, 100.0),
];

const RETURN_POINTS: &[(f64, f64)] = &[
    (-0.10, 0.0),
    (0.00, 10.0),
    (0.02, 25.0),
    (0.05, 45.0),
    (0.10, 70.0),
    (0.20, 90.0),
    (0.30, 100.0),
];

const SHARPE_POINTS: &[(f64, f64)] = &[
    (0.0, 0.0),
    (0.5, 15.0),
    (1.0, 40.0),
    (1.5, 65.0),
    (2.0, 85.0),
    (3.0, 100.0),
];

const DRAWDOWN_POINTS: &[(f64, f64)] = &[
    (0.00, 100.0),
    (0.02, 95.0),
    (0.05, 80.0),
    (0.10, 55.0),
    (0.15, 30.0),
    (0.25, 10.0),
    (0.40, 0.0),
];

const PROFIT_FACTOR_POINTS: &[(f64, f64)] = &[
    (0.0, 0.0),
    (1.0, 10.0),
    (1.2, 30.0),
    (1.5, 55.0),
    (2.0, 80.0),
    (3.0, 100.0),
];

/// Sub-scores and penalties behind a fitness value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitnessBreakdown {
    pub win_rate: f64,
    pub total_return: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    pub profit_factor: f64,
    pub sample_penalty: f64,
    pub overtrading_penalty: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct FitnessEvaluator {
    pub min_sample_size: u32,
    /// Trades per evaluation window above which a light penalty applies
    pub over_trading_bound: u32,
}

impl Default for FitnessEvaluator {
    fn default() -> Self {
        Self {
            min_sample_size: 10,
            over_trading_bound: 200,
        }
    }
}

impl FitnessEvaluator {
    pub fn new(min_sample_size: u32, over_trading_bound: u32) -> Self {
        Self {
            min_sample_size,
            over_trading_bound,
        }
    }

    /// Composite fitness in [0, 100]
    pub fn score(&self, stats: &StatsSnapshot) -> f64 {
        self.breakdown(stats).score
    }

    pub fn breakdown(&self, stats: &StatsSnapshot) -> FitnessBreakdown {
        let win_rate = if stats.win_rate.is_finite() && (0.0..=1.0).contains(&stats.win_rate) {
            ramp(stats.win_rate, WIN_RATE_POINTS)
        } else {
            0.0
        };
        let total_return = if stats.total_return.is_finite() {
            ramp(stats.total_return, RETURN_POINTS)
        } else {
            0.0
        };
        let sharpe = if stats.sharpe_ratio.is_finite() {
            ramp(stats.sharpe_ratio, SHARPE_POINTS)
        } else {
            0.0
        };
        let drawdown = if stats.max_drawdown.is_finite() && (0.0..=1.0).contains(&stats.max_drawdown) {
            ramp(stats.max_drawdown, DRAWDOWN_POINTS)
        } else {
            0.0
        };
        let profit_factor = if stats.profit_factor.is_finite() && stats.profit_factor >= 0.0 {
            ramp(stats.profit_factor, PROFIT_FACTOR_POINTS)
        } else {
            0.0
        };

        let weighted = win_rate * WIN_RATE_WEIGHT
            + total_return * RETURN_WEIGHT
            + sharpe * SHARPE_WEIGHT
            + drawdown * DRAWDOWN_WEIGHT
            + profit_factor * PROFIT_FACTOR_WEIGHT;

        let trades = stats.trade_count.max(0) as f64;
        let min_sample = self.min_sample_size as f64;
        let sample_penalty = if min_sample > 0.0 && trades < min_sample {
            SAMPLE_PENALTY_MAX * (min_sample - trades) / min_sample
        } else {
            0.0
        };

        let bound = self.over_trading_bound as f64;
        let overtrading_penalty = if bound > 0.0 && trades > bound {
            (OVERTRADING_PENALTY_MAX * (trades - bound) / bound).min(OVERTRADING_PENALTY_MAX)
        } else {
            0.0
        };

        let score = (weighted - sample_penalty - overtrading_penalty).clamp(0.0, 100.0);

        FitnessBreakdown {
            win_rate,
            total_return,
            sharpe,
            drawdown,
            profit_factor,
            sample_penalty,
            overtrading_penalty,
            score,
        }
    }
}

/// Piecewise-linear interpolation, flat outside the first and last points
fn ramp(x: f64, points: &[(f64, f64)]) -> f64 {
    let (first_x, first_y) = points[0];
    if x <= first_x {
        return first_y;
    }
    for pair in points.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if x <= x1 {
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    points[points.len() - 1].1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn stats(win_rate: f64, ret: f64, sharpe: f64, dd: f64, pf: f64, trades: i64) -> StatsSnapshot {
        StatsSnapshot {
            win_rate,
            total_return: ret,
            sharpe_ratio: sharpe,
            max_drawdown: dd,
            profit_factor: pf,
            trade_count: trades,
        }
    }

    #[test]
    fn test_ramp_interpolates_and_saturates() {
        assert_eq!(ramp(0.30, WIN_RATE_POINTS), 0.0);
        assert_eq!(ramp(0.90, WIN_RATE_POINTS), 100.0);
        assert!((ramp(0.575, WIN_RATE_POINTS) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_strong_stats_score_high() {
        let eval = FitnessEvaluator::default();
        let s = eval.score(&stats(0.80, 0.30, 3.0, 0.0, 3.0, 50));
        assert!((s - 100.0).abs() < 1e-9);
        let s = eval.score(&stats(0.70, 0.20, 2.0, 0.03, 2.0, 50));
        assert!(s >= 80.0, "got {s}");
    }

    #[test]
    fn test_mediocre_stats_stay_below_qualification() {
        let eval = FitnessEvaluator::default();
        let s = eval.score(&stats(0.52, 0.01, 0.5, 0.12, 1.1, 40));
        assert!(s < 60.0, "got {s}");
    }

    #[test]
    fn test_thin_sample_is_penalized() {
        let eval = FitnessEvaluator::default();
        let full = eval.score(&stats(0.65, 0.10, 1.5, 0.05, 1.5, 10));
        let thin = eval.score(&stats(0.65, 0.10, 1.5, 0.05, 1.5, 5));
        assert!((full - thin - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_overtrading_penalty_is_light() {
        let eval = FitnessEvaluator::default();
        let normal = eval.breakdown(&stats(0.65, 0.10, 1.5, 0.05, 1.5, 200));
        let heavy = eval.breakdown(&stats(0.65, 0.10, 1.5, 0.05, 1.5, 10_000));
        assert_eq!(normal.overtrading_penalty, 0.0);
        assert_eq!(heavy.overtrading_penalty, OVERTRADING_PENALTY_MAX);
    }

    #[test]
    fn test_invalid_inputs_get_worst_sub_score() {
        let eval = FitnessEvaluator::default();
        let b = eval.breakdown(&stats(f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.5, -1.0, -3));
        assert_eq!(b.win_rate, 0.0);
        assert_eq!(b.total_return, 0.0);
        assert_eq!(b.sharpe, 0.0);
        assert_eq!(b.drawdown, 0.0);
        assert_eq!(b.profit_factor, 0.0);
        assert_eq!(b.sample_penalty, SAMPLE_PENALTY_MAX);
        assert_eq!(b.score, 0.0);
    }

    #[test]
    fn test_score_always_bounded() {
        let eval = FitnessEvaluator::default();
        let mut rng = StdRng::seed_from_u64(1);
        let specials = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -1e9, 1e9];
        for i in 0..2000 {
            let trades = rng.gen_range(-10..500);
            let mut pick = |lo: f64, hi: f64| {
                if i % 7 == 0 {
                    specials[rng.gen_range(0..specials.len())]
                } else {
                    rng.gen_range(lo..hi)
                }
            };
            let s = stats(
                pick(-0.5, 1.5),
                pick(-1.0, 1.0),
                pick(-5.0, 5.0),
                pick(-0.5, 1.5),
                pick(-1.0, 10.0),
                trades,
            );
            let score = eval.score(&s);
            assert!((0.0..=100.0).contains(&score), "score {score} for {s:?}");
        }
    }
}
