//! Strategy Evolution Engine
//!
//! Manages a population of parameterized trading strategies:
//! - Fitness scoring of trade statistics
//! - Dynamic-threshold elimination, elite selection and reproduction
//!   (mutation, crossover, random spawn)
//! - Tiered capital allocation across qualified strategies
//! - Evolution, signal and health loops with single-flight triggers
//! - TTL cache for balance and positions
//! - Binance public API client for market data

pub mod account;
pub mod allocator;
pub mod api;
pub mod archetypes;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fitness;
pub mod metrics;
pub mod population;
pub mod reproduction;
pub mod scheduler;
pub mod simulation;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use account::{AccountSource, PaperAccount};
pub use allocator::{AllocationPlan, AllocationPolicy, CapitalAllocator};
pub use api::{BinanceClient, MarketDataClient};
pub use archetypes::{ArchetypeRegistry, SignalIntent, StrategyArchetype};
pub use cache::{CacheError, CacheKey, CacheLayer, CacheRead, CacheStatus, InvalidationReason};
pub use config::EngineConfig;
pub use engine::{CycleReport, Engine, SignalOutcome, SignalReport};
pub use error::{EngineError, EngineResult};
pub use fitness::{FitnessBreakdown, FitnessEvaluator};
pub use population::{PopulationManager, PopulationPolicy, ReproductionPlan, SelectionOutcome};
pub use reproduction::{Offspring, ReproductionError, ReproductionOperators, SpawnTemplates};
pub use scheduler::{HealthReport, LoopKind, LoopState, LoopStatus, Scheduler, SkipReason, TriggerOutcome};
pub use simulation::{SimulationConfig, SimulationError, SimulationReport, Simulator};
pub use store::{MemoryStore, SignalFilter, SqliteStrategyStore, StrategyFilter, StrategyStore};
pub use types::*;
