//! Domain types for the strategy population

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single candlestick (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Side of a trade or signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Ordered parameter map (name -> value). Semantics are defined per archetype.
pub type Parameters = BTreeMap<String, f64>;

// ============================================================================
// Strategy archetypes and lifecycle
// ============================================================================

/// Strategy families. Each one declares its own parameter schema and signal logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchetypeKind {
    Momentum,
    MeanReversion,
    RsiReversal,
    TrendFollowing,
    Breakout,
    GridTrading,
}

impl ArchetypeKind {
    pub const ALL: [ArchetypeKind; 6] = [
        ArchetypeKind::Momentum,
        ArchetypeKind::MeanReversion,
        ArchetypeKind::RsiReversal,
        ArchetypeKind::TrendFollowing,
        ArchetypeKind::Breakout,
        ArchetypeKind::GridTrading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchetypeKind::Momentum => "momentum",
            ArchetypeKind::MeanReversion => "mean_reversion",
            ArchetypeKind::RsiReversal => "rsi_reversal",
            ArchetypeKind::TrendFollowing => "trend_following",
            ArchetypeKind::Breakout => "breakout",
            ArchetypeKind::GridTrading => "grid_trading",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ArchetypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchetypeKind::Momentum => write!(f, "Momentum"),
            ArchetypeKind::MeanReversion => write!(f, "Mean Reversion"),
            ArchetypeKind::RsiReversal => write!(f, "RSI Reversal"),
            ArchetypeKind::TrendFollowing => write!(f, "Trend Following"),
            ArchetypeKind::Breakout => write!(f, "Breakout"),
            ArchetypeKind::GridTrading => write!(f, "Grid Trading"),
        }
    }
}

/// Lifecycle of a strategy record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    /// Created by reproduction, not yet evaluated
    Candidate,
    /// Bootstrap simulation done, fitness known
    Simulated,
    /// Fitness crossed the live-trading threshold
    Qualified,
    /// Funded by the capital allocator
    Active,
    /// Removed from the population (row kept for audit)
    Eliminated,
}

impl LifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Candidate => "candidate",
            LifecycleStage::Simulated => "simulated",
            LifecycleStage::Qualified => "qualified",
            LifecycleStage::Active => "active",
            LifecycleStage::Eliminated => "eliminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(LifecycleStage::Candidate),
            "simulated" => Some(LifecycleStage::Simulated),
            "qualified" => Some(LifecycleStage::Qualified),
            "active" => Some(LifecycleStage::Active),
            "eliminated" => Some(LifecycleStage::Eliminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Statistics and strategy records
// ============================================================================

/// Trade statistics a strategy is scored on
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Fraction of winning trades, 0..1
    pub win_rate: f64,
    /// Fractional return over the evaluation window (0.05 = +5%)
    pub total_return: f64,
    pub sharpe_ratio: f64,
    /// Peak-to-trough drawdown as a fraction, 0..1
    pub max_drawdown: f64,
    pub profit_factor: f64,
    pub trade_count: i64,
}

/// A member of the strategy population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub archetype: ArchetypeKind,
    pub symbol: String,
    pub parameters: Parameters,
    pub generation: u32,
    /// Evolution cycles survived in the current generation
    pub round: u32,
    pub stage: LifecycleStage,
    pub enabled: bool,
    pub fitness: f64,
    pub stats: StatsSnapshot,
    /// Id snapshots of the parents (0, 1 or 2), never live references
    pub parent_ids: Vec<String>,
    pub allocation: Option<CapitalAllocation>,
    /// Last time this strategy was used as a reproduction parent
    pub last_evolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRecord {
    /// A fresh, unevaluated record
    pub fn candidate(
        id: String,
        archetype: ArchetypeKind,
        symbol: String,
        parameters: Parameters,
        generation: u32,
        parent_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            archetype,
            symbol,
            parameters,
            generation,
            round: 0,
            stage: LifecycleStage::Candidate,
            enabled: true,
            fitness: 0.0,
            stats: StatsSnapshot::default(),
            parent_ids,
            allocation: None,
            last_evolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_eliminated(&self) -> bool {
        self.stage == LifecycleStage::Eliminated
    }

    /// Move to a new stage, keeping `enabled` and the allocation consistent with it
    pub fn transition(&mut self, stage: LifecycleStage, now: DateTime<Utc>) {
        self.stage = stage;
        if stage != LifecycleStage::Active {
            self.allocation = None;
        }
        if stage == LifecycleStage::Eliminated {
            self.enabled = false;
        }
        self.updated_at = now;
    }
}

// ============================================================================
// Evolution audit log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionEventType {
    Spawn,
    Mutate,
    Crossover,
    Eliminate,
    Survive,
    Promote,
    Demote,
}

impl EvolutionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionEventType::Spawn => "spawn",
            EvolutionEventType::Mutate => "mutate",
            EvolutionEventType::Crossover => "crossover",
            EvolutionEventType::Eliminate => "eliminate",
            EvolutionEventType::Survive => "survive",
            EvolutionEventType::Promote => "promote",
            EvolutionEventType::Demote => "demote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawn" => Some(EvolutionEventType::Spawn),
            "mutate" => Some(EvolutionEventType::Mutate),
            "crossover" => Some(EvolutionEventType::Crossover),
            "eliminate" => Some(EvolutionEventType::Eliminate),
            "survive" => Some(EvolutionEventType::Survive),
            "promote" => Some(EvolutionEventType::Promote),
            "demote" => Some(EvolutionEventType::Demote),
            _ => None,
        }
    }
}

/// Append-only audit record. `sequence` is assigned by the store on commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub sequence: Option<i64>,
    pub strategy_id: String,
    pub event_type: EvolutionEventType,
    pub old_parameters: Option<Parameters>,
    pub new_parameters: Option<Parameters>,
    pub old_fitness: Option<f64>,
    pub new_fitness: Option<f64>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl EvolutionEvent {
    pub fn new(
        strategy_id: impl Into<String>,
        event_type: EvolutionEventType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            sequence: None,
            strategy_id: strategy_id.into(),
            event_type,
            old_parameters: None,
            new_parameters: None,
            old_fitness: None,
            new_fitness: None,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_parameters(mut self, old: Option<Parameters>, new: Option<Parameters>) -> Self {
        self.old_parameters = old;
        self.new_parameters = new;
        self
    }

    pub fn with_fitness(mut self, old: Option<f64>, new: Option<f64>) -> Self {
        self.old_fitness = old;
        self.new_fitness = new;
        self
    }
}

// ============================================================================
// Capital, signals, trades, account state
// ============================================================================

/// Fitness bucket used for allocation ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationTier {
    Observed,
    Promising,
    Quality,
    Elite,
    Legendary,
}

impl AllocationTier {
    pub fn from_fitness(fitness: f64) -> Self {
        if fitness >= 90.0 {
            AllocationTier::Legendary
        } else if fitness >= 80.0 {
            AllocationTier::Elite
        } else if fitness >= 70.0 {
            AllocationTier::Quality
        } else if fitness >= 60.0 {
            AllocationTier::Promising
        } else {
            AllocationTier::Observed
        }
    }

    /// Share of a full allocation this tier is entitled to
    pub fn ratio(&self) -> f64 {
        match self {
            AllocationTier::Legendary => 1.0,
            AllocationTier::Elite => 0.8,
            AllocationTier::Quality => 0.6,
            AllocationTier::Promising => 0.3,
            AllocationTier::Observed => 0.0,
        }
    }
}

impl std::fmt::Display for AllocationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationTier::Legendary => write!(f, "legendary"),
            AllocationTier::Elite => write!(f, "elite"),
            AllocationTier::Quality => write!(f, "quality"),
            AllocationTier::Promising => write!(f, "promising"),
            AllocationTier::Observed => write!(f, "observed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalAllocation {
    pub strategy_id: String,
    pub tier: AllocationTier,
    pub ratio: f64,
    pub amount: Decimal,
    pub computed_at: DateTime<Utc>,
}

/// A trading signal produced by an active strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// 0..1
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub executed: bool,
}

/// A closed trade reported by the execution side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub strategy_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// An opening fill reported by the execution side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFill {
    pub strategy_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub signal_id: Option<String>,
}

/// Account balance as reported by the account source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub total: Decimal,
    pub available: Decimal,
}

/// An open position as reported by the account source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}
