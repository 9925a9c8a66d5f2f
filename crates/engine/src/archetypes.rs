//! Strategy archetypes
//!
//! Each archetype declares a parameter schema and turns a parameter map into a
//! bar-by-bar `SignalGenerator` built on `ta` indicators. The registry is the
//! single lookup table used by reproduction, simulation and the signal loop.

use crate::types::{ArchetypeKind, Kline, Parameters, TradeSide};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, Maximum, Minimum, RateOfChange,
    RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::Next;
use thiserror::Error;

// ============================================================================
// Core types
// ============================================================================

/// Declared range of one parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    /// Integer parameters are rounded after mutation and crossover
    pub integer: bool,
}

impl ParamSpec {
    const fn int(name: &'static str, min: f64, max: f64) -> Self {
        Self { name, min, max, integer: true }
    }

    const fn float(name: &'static str, min: f64, max: f64) -> Self {
        Self { name, min, max, integer: false }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Clamp into range, rounding integer parameters
    pub fn normalize(&self, value: f64) -> f64 {
        let v = value.clamp(self.min, self.max);
        if self.integer {
            v.round()
        } else {
            v
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A per-bar signal with a confidence score (0.3–1.0 when not holding)
#[derive(Debug, Clone, Copy)]
pub struct SignalWithConfidence {
    pub action: SignalAction,
    pub confidence: f64,
}

impl SignalWithConfidence {
    pub fn hold() -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
        }
    }

    pub fn buy(confidence: f64) -> Self {
        Self {
            action: SignalAction::Buy,
            confidence: clamp_confidence(confidence),
        }
    }

    pub fn sell(confidence: f64) -> Self {
        Self {
            action: SignalAction::Sell,
            confidence: clamp_confidence(confidence),
        }
    }

    pub fn intent(&self) -> Option<SignalIntent> {
        let side = match self.action {
            SignalAction::Buy => TradeSide::Buy,
            SignalAction::Sell => TradeSide::Sell,
            SignalAction::Hold => return None,
        };
        Some(SignalIntent {
            side,
            confidence: self.confidence,
        })
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.3, 1.0)
    } else {
        0.3
    }
}

/// What an archetype wants to do on the latest bar of a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalIntent {
    pub side: TradeSide,
    pub confidence: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("Insufficient data: need {needed} bars, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("Unknown archetype: {0}")]
    UnknownArchetype(String),

    #[error("Missing parameter: {0}")]
    Missing(String),

    #[error("Unexpected parameter: {0}")]
    Unexpected(String),

    #[error("Parameter {name} = {value} outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Bar-by-bar signal generation
pub trait SignalGenerator: Send {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence;
}

/// A strategy family
pub trait StrategyArchetype: Send + Sync {
    fn kind(&self) -> ArchetypeKind;

    fn parameter_ranges(&self) -> &'static [ParamSpec];

    /// Bars needed before the generator can emit anything meaningful
    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError>;

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError>;

    /// Feed the whole window and report the signal on its last bar
    fn generate_signal(
        &self,
        params: &Parameters,
        window: &[Kline],
    ) -> Result<Option<SignalIntent>, SignalError> {
        let needed = self.warmup_bars(params)?;
        if window.len() < needed {
            return Err(SignalError::InsufficientData {
                needed,
                available: window.len(),
            });
        }

        let bars = price_bars(window)?;
        let mut generator = self.signal_generator(params)?;
        let mut last = SignalWithConfidence::hold();
        for bar in &bars {
            last = generator.on_bar(bar);
        }
        Ok(last.intent())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Prices of one bar as the indicators consume them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    fn from_kline(kline: &Kline) -> Option<Self> {
        Some(Self {
            high: kline.high.to_f64()?,
            low: kline.low.to_f64()?,
            close: kline.close.to_f64()?,
        })
    }
}

/// Convert a window for the indicators. The usable window ends at the
/// first bar whose prices have no f64 representation.
pub fn price_bars(window: &[Kline]) -> Result<Vec<Bar>, SignalError> {
    window
        .iter()
        .enumerate()
        .map(|(i, kline)| {
            Bar::from_kline(kline).ok_or(SignalError::InsufficientData {
                needed: window.len(),
                available: i,
            })
        })
        .collect()
}

fn param(params: &Parameters, name: &'static str) -> Result<f64, SignalError> {
    match params.get(name) {
        Some(v) if v.is_finite() => Ok(*v),
        Some(v) => Err(SignalError::InvalidParameter { name, value: *v }),
        None => Err(SignalError::MissingParameter(name)),
    }
}

fn period(params: &Parameters, name: &'static str) -> Result<usize, SignalError> {
    let value = param(params, name)?;
    if value < 1.0 {
        return Err(SignalError::InvalidParameter { name, value });
    }
    Ok(value.round() as usize)
}

fn invalid(name: &'static str, value: f64) -> SignalError {
    SignalError::InvalidParameter { name, value }
}

// ============================================================================
// 1. Momentum (rate of change)
// ============================================================================

const MOMENTUM_PARAMS: [ParamSpec; 2] = [
    ParamSpec::int("lookback", 5.0, 50.0),
    ParamSpec::float("entry_threshold", 0.5, 5.0),
];

pub struct MomentumArchetype;

struct MomentumGenerator {
    roc: RateOfChange,
    lookback: usize,
    threshold: f64,
    bars_seen: usize,
}

impl SignalGenerator for MomentumGenerator {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence {
        // percent change over the lookback
        let roc = self.roc.next(bar.close);
        self.bars_seen += 1;
        if self.bars_seen <= self.lookback {
            return SignalWithConfidence::hold();
        }

        if roc > self.threshold {
            SignalWithConfidence::buy(roc / (self.threshold * 3.0))
        } else if roc < -self.threshold {
            SignalWithConfidence::sell(-roc / (self.threshold * 3.0))
        } else {
            SignalWithConfidence::hold()
        }
    }
}

impl StrategyArchetype for MomentumArchetype {
    fn kind(&self) -> ArchetypeKind {
        ArchetypeKind::Momentum
    }

    fn parameter_ranges(&self) -> &'static [ParamSpec] {
        &MOMENTUM_PARAMS
    }

    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError> {
        Ok(period(params, "lookback")? + 1)
    }

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError> {
        let lookback = period(params, "lookback")?;
        let threshold = param(params, "entry_threshold")?;
        if threshold <= 0.0 {
            return Err(invalid("entry_threshold", threshold));
        }
        Ok(Box::new(MomentumGenerator {
            roc: RateOfChange::new(lookback).map_err(|_| invalid("lookback", lookback as f64))?,
            lookback,
            threshold,
            bars_seen: 0,
        }))
    }
}

// ============================================================================
// 2. Mean reversion (Bollinger bands)
// ============================================================================

const MEAN_REVERSION_PARAMS: [ParamSpec; 2] = [
    ParamSpec::int("period", 10.0, 40.0),
    ParamSpec::float("multiplier", 1.5, 3.0),
];

pub struct MeanReversionArchetype;

struct MeanReversionGenerator {
    bb: BollingerBands,
    period: usize,
    bars_seen: usize,
}

impl SignalGenerator for MeanReversionGenerator {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence {
        let close = bar.close;
        let bands = self.bb.next(close);
        self.bars_seen += 1;
        if self.bars_seen < self.period {
            return SignalWithConfidence::hold();
        }

        let bandwidth = bands.upper - bands.lower;
        if bandwidth <= 0.0 {
            return SignalWithConfidence::hold();
        }

        if close < bands.lower {
            SignalWithConfidence::buy((bands.lower - close) / bandwidth)
        } else if close > bands.upper {
            SignalWithConfidence::sell((close - bands.upper) / bandwidth)
        } else {
            SignalWithConfidence::hold()
        }
    }
}

impl StrategyArchetype for MeanReversionArchetype {
    fn kind(&self) -> ArchetypeKind {
        ArchetypeKind::MeanReversion
    }

    fn parameter_ranges(&self) -> &'static [ParamSpec] {
        &MEAN_REVERSION_PARAMS
    }

    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError> {
        period(params, "period")
    }

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError> {
        let p = period(params, "period")?;
        let multiplier = param(params, "multiplier")?;
        Ok(Box::new(MeanReversionGenerator {
            bb: BollingerBands::new(p, multiplier).map_err(|_| invalid("multiplier", multiplier))?,
            period: p,
            bars_seen: 0,
        }))
    }
}

// ============================================================================
// 3. RSI reversal
// ============================================================================

const RSI_PARAMS: [ParamSpec; 3] = [
    ParamSpec::int("period", 5.0, 28.0),
    ParamSpec::float("overbought", 60.0, 85.0),
    ParamSpec::float("oversold", 15.0, 40.0),
];

pub struct RsiReversalArchetype;

struct RsiGenerator {
    rsi: RelativeStrengthIndex,
    period: usize,
    overbought: f64,
    oversold: f64,
    bars_seen: usize,
}

impl SignalGenerator for RsiGenerator {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence {
        let val = self.rsi.next(bar.close);
        self.bars_seen += 1;
        if self.bars_seen <= self.period {
            return SignalWithConfidence::hold();
        }

        if val < self.oversold {
            SignalWithConfidence::buy((self.oversold - val) / self.oversold)
        } else if val > self.overbought {
            SignalWithConfidence::sell((val - self.overbought) / (100.0 - self.overbought))
        } else {
            SignalWithConfidence::hold()
        }
    }
}

impl StrategyArchetype for RsiReversalArchetype {
    fn kind(&self) -> ArchetypeKind {
        ArchetypeKind::RsiReversal
    }

    fn parameter_ranges(&self) -> &'static [ParamSpec] {
        &RSI_PARAMS
    }

    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError> {
        Ok(period(params, "period")? + 1)
    }

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError> {
        let p = period(params, "period")?;
        let overbought = param(params, "overbought")?;
        let oversold = param(params, "oversold")?;
        if oversold <= 0.0 || overbought >= 100.0 || oversold >= overbought {
            return Err(invalid("oversold", oversold));
        }
        Ok(Box::new(RsiGenerator {
            rsi: RelativeStrengthIndex::new(p).map_err(|_| invalid("period", p as f64))?,
            period: p,
            overbought,
            oversold,
            bars_seen: 0,
        }))
    }
}

// ============================================================================
// 4. Trend following (EMA crossover)
// ============================================================================

const TREND_PARAMS: [ParamSpec; 2] = [
    ParamSpec::int("fast_period", 5.0, 20.0),
    ParamSpec::int("slow_period", 21.0, 100.0),
];

pub struct TrendFollowingArchetype;

struct TrendGenerator {
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    slow_period: usize,
    prev_fast: f64,
    prev_slow: f64,
    bars_seen: usize,
}

impl SignalGenerator for TrendGenerator {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence {
        let close = bar.close;
        let fast = self.ema_fast.next(close);
        let slow = self.ema_slow.next(close);
        self.bars_seen += 1;

        let result = if self.bars_seen > self.slow_period && slow > 0.0 {
            let conf = (fast - slow).abs() / slow * 100.0;
            if self.prev_fast <= self.prev_slow && fast > slow {
                SignalWithConfidence::buy(conf)
            } else if self.prev_fast >= self.prev_slow && fast < slow {
                SignalWithConfidence::sell(conf)
            } else {
                SignalWithConfidence::hold()
            }
        } else {
            SignalWithConfidence::hold()
        };

        self.prev_fast = fast;
        self.prev_slow = slow;
        result
    }
}

impl StrategyArchetype for TrendFollowingArchetype {
    fn kind(&self) -> ArchetypeKind {
        ArchetypeKind::TrendFollowing
    }

    fn parameter_ranges(&self) -> &'static [ParamSpec] {
        &TREND_PARAMS
    }

    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError> {
        Ok(period(params, "slow_period")? + 1)
    }

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError> {
        let fast = period(params, "fast_period")?;
        let slow = period(params, "slow_period")?;
        if fast >= slow {
            return Err(invalid("fast_period", fast as f64));
        }
        Ok(Box::new(TrendGenerator {
            ema_fast: ExponentialMovingAverage::new(fast).map_err(|_| invalid("fast_period", fast as f64))?,
            ema_slow: ExponentialMovingAverage::new(slow).map_err(|_| invalid("slow_period", slow as f64))?,
            slow_period: slow,
            prev_fast: 0.0,
            prev_slow: 0.0,
            bars_seen: 0,
        }))
    }
}

// ============================================================================
// 5. Channel breakout
// ============================================================================

const BREAKOUT_PARAMS: [ParamSpec; 2] = [
    ParamSpec::int("lookback", 10.0, 60.0),
    ParamSpec::float("buffer_pct", 0.0, 1.0),
];

pub struct BreakoutArchetype;

struct BreakoutGenerator {
    highest: Maximum,
    lowest: Minimum,
    lookback: usize,
    buffer: f64,
    /// Channel of the previous bars, excluding the current one
    channel: Option<(f64, f64)>,
    bars_seen: usize,
}

impl SignalGenerator for BreakoutGenerator {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence {
        let close = bar.close;
        self.bars_seen += 1;

        let result = match self.channel {
            Some((high, low)) if self.bars_seen > self.lookback && high > low => {
                let upper = high * (1.0 + self.buffer / 100.0);
                let lower = low * (1.0 - self.buffer / 100.0);
                let width = high - low;
                if close > upper {
                    SignalWithConfidence::buy((close - upper) / width * 10.0)
                } else if close < lower {
                    SignalWithConfidence::sell((lower - close) / width * 10.0)
                } else {
                    SignalWithConfidence::hold()
                }
            }
            _ => SignalWithConfidence::hold(),
        };

        let high = self.highest.next(bar.high);
        let low = self.lowest.next(bar.low);
        self.channel = Some((high, low));
        result
    }
}

impl StrategyArchetype for BreakoutArchetype {
    fn kind(&self) -> ArchetypeKind {
        ArchetypeKind::Breakout
    }

    fn parameter_ranges(&self) -> &'static [ParamSpec] {
        &BREAKOUT_PARAMS
    }

    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError> {
        Ok(period(params, "lookback")? + 1)
    }

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError> {
        let lookback = period(params, "lookback")?;
        let buffer = param(params, "buffer_pct")?;
        if buffer < 0.0 {
            return Err(invalid("buffer_pct", buffer));
        }
        Ok(Box::new(BreakoutGenerator {
            highest: Maximum::new(lookback).map_err(|_| invalid("lookback", lookback as f64))?,
            lowest: Minimum::new(lookback).map_err(|_| invalid("lookback", lookback as f64))?,
            lookback,
            buffer,
            channel: None,
            bars_seen: 0,
        }))
    }
}

// ============================================================================
// 6. Grid trading around a moving anchor
// ============================================================================

const GRID_PARAMS: [ParamSpec; 3] = [
    ParamSpec::float("grid_spacing_pct", 0.3, 3.0),
    ParamSpec::int("levels", 3.0, 10.0),
    ParamSpec::int("anchor_period", 20.0, 100.0),
];

pub struct GridTradingArchetype;

struct GridGenerator {
    anchor: SimpleMovingAverage,
    anchor_period: usize,
    spacing: f64,
    levels: i64,
    /// Signed grid level of the previous bar (negative = below anchor)
    prev_level: i64,
    bars_seen: usize,
}

impl SignalGenerator for GridGenerator {
    fn on_bar(&mut self, bar: &Bar) -> SignalWithConfidence {
        let close = bar.close;
        let anchor = self.anchor.next(close);
        self.bars_seen += 1;
        if self.bars_seen < self.anchor_period || anchor <= 0.0 {
            return SignalWithConfidence::hold();
        }

        let deviation_pct = (close - anchor) / anchor * 100.0;
        let level = ((deviation_pct / self.spacing).trunc() as i64).clamp(-self.levels, self.levels);

        // Only act when price crosses into a deeper grid line
        let result = if level < 0 && level < self.prev_level {
            SignalWithConfidence::buy(level.unsigned_abs() as f64 / self.levels as f64)
        } else if level > 0 && level > self.prev_level {
            SignalWithConfidence::sell(level as f64 / self.levels as f64)
        } else {
            SignalWithConfidence::hold()
        };

        self.prev_level = level;
        result
    }
}

impl StrategyArchetype for GridTradingArchetype {
    fn kind(&self) -> ArchetypeKind {
        ArchetypeKind::GridTrading
    }

    fn parameter_ranges(&self) -> &'static [ParamSpec] {
        &GRID_PARAMS
    }

    fn warmup_bars(&self, params: &Parameters) -> Result<usize, SignalError> {
        period(params, "anchor_period")
    }

    fn signal_generator(&self, params: &Parameters) -> Result<Box<dyn SignalGenerator>, SignalError> {
        let spacing = param(params, "grid_spacing_pct")?;
        if spacing <= 0.0 {
            return Err(invalid("grid_spacing_pct", spacing));
        }
        let levels = period(params, "levels")? as i64;
        let anchor_period = period(params, "anchor_period")?;
        Ok(Box::new(GridGenerator {
            anchor: SimpleMovingAverage::new(anchor_period)
                .map_err(|_| invalid("anchor_period", anchor_period as f64))?,
            anchor_period,
            spacing,
            levels,
            prev_level: 0,
            bars_seen: 0,
        }))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Lookup table from archetype kind to its implementation
pub struct ArchetypeRegistry {
    archetypes: HashMap<ArchetypeKind, Arc<dyn StrategyArchetype>>,
}

impl ArchetypeRegistry {
    pub fn empty() -> Self {
        Self {
            archetypes: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(MomentumArchetype));
        registry.register(Arc::new(MeanReversionArchetype));
        registry.register(Arc::new(RsiReversalArchetype));
        registry.register(Arc::new(TrendFollowingArchetype));
        registry.register(Arc::new(BreakoutArchetype));
        registry.register(Arc::new(GridTradingArchetype));
        registry
    }

    pub fn register(&mut self, archetype: Arc<dyn StrategyArchetype>) {
        self.archetypes.insert(archetype.kind(), archetype);
    }

    pub fn get(&self, kind: ArchetypeKind) -> Option<&Arc<dyn StrategyArchetype>> {
        self.archetypes.get(&kind)
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<ArchetypeKind> {
        let mut kinds: Vec<_> = self.archetypes.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Every declared parameter present, finite and in range; nothing extra
    pub fn validate_parameters(
        &self,
        kind: ArchetypeKind,
        params: &Parameters,
    ) -> Result<(), ParameterError> {
        let archetype = self
            .get(kind)
            .ok_or_else(|| ParameterError::UnknownArchetype(kind.as_str().to_string()))?;
        let specs = archetype.parameter_ranges();

        for spec in specs {
            let value = params
                .get(spec.name)
                .copied()
                .ok_or_else(|| ParameterError::Missing(spec.name.to_string()))?;
            if !spec.contains(value) {
                return Err(ParameterError::OutOfRange {
                    name: spec.name.to_string(),
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
        if let Some(extra) = params.keys().find(|k| !specs.iter().any(|s| s.name == k.as_str())) {
            return Err(ParameterError::Unexpected(extra.clone()));
        }
        Ok(())
    }

    /// Uniformly sample every parameter in its declared range
    pub fn sample_parameters(&self, kind: ArchetypeKind, rng: &mut impl Rng) -> Option<Parameters> {
        let archetype = self.get(kind)?;
        Some(
            archetype
                .parameter_ranges()
                .iter()
                .map(|spec| {
                    let raw = if spec.width() > 0.0 {
                        rng.gen_range(spec.min..=spec.max)
                    } else {
                        spec.min
                    };
                    (spec.name.to_string(), spec.normalize(raw))
                })
                .collect(),
        )
    }
}

impl Default for ArchetypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
