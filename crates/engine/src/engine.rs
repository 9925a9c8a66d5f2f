//! The evolution engine
//!
//! One `Engine` is built at startup and shared behind an `Arc`. The
//! population gate serializes evolution (write side) against signal
//! generation (read side); account state goes through the cache layer.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::account::{AccountSource, PaperAccount};
use crate::allocator::{AllocationPolicy, CapitalAllocator};
use crate::api::MarketDataClient;
use crate::archetypes::{ArchetypeRegistry, SignalError};
use crate::cache::{CacheKey, CacheLayer, CacheStatus, InvalidationReason};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::fitness::FitnessEvaluator;
use crate::metrics::live_stats;
use crate::population::{PopulationManager, PopulationPolicy};
use crate::reproduction::{Offspring, ReproductionOperators, SpawnTemplates};
use crate::simulation::{SimulationConfig, SimulationError, Simulator};
use crate::store::{StrategyFilter, StrategyStore};
use crate::types::{
    EntryFill, EvolutionEvent, EvolutionEventType, Kline, LifecycleStage, Signal, StrategyRecord,
    TradeRecord,
};

/// Summary of one evolution cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub threshold: f64,
    pub evaluated: usize,
    pub simulated: usize,
    /// Candidates left unevaluated for lack of market data
    pub insufficient_data: usize,
    pub survivors: usize,
    pub eliminated: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub offspring: usize,
    pub rejected_offspring: usize,
    pub backfilled: usize,
    pub funded: usize,
    pub allocated: Decimal,
    /// Set when allocations were left untouched this cycle
    pub allocation_skipped: Option<String>,
    pub events: usize,
    pub duration_ms: u64,
}

/// Summary of one signal cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalReport {
    pub active: usize,
    pub emitted: usize,
    pub duplicates: usize,
    pub idle: usize,
    pub insufficient_data: usize,
    pub invalid: usize,
}

/// What generating a signal for one strategy produced
#[derive(Debug, Clone)]
pub enum SignalOutcome {
    Emitted(Signal),
    NoSignal,
    InsufficientData(String),
    /// The record cannot produce signals (bad parameters, no allocation)
    Invalid(String),
}

/// Decisions of one evolution cycle, computed before anything is written
struct CyclePlan {
    report: CycleReport,
    started: Instant,
    records: Vec<StrategyRecord>,
    offspring: Vec<Offspring>,
    events: Vec<EvolutionEvent>,
}

/// Resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn StrategyStore>,
    market: Arc<dyn MarketDataClient>,
    cache: Arc<CacheLayer>,
    paper: Option<Arc<PaperAccount>>,
    operators: ReproductionOperators,
    allocator: CapitalAllocator,
    population: Mutex<PopulationManager>,
    population_gate: RwLock<()>,
    simulation: SimulationConfig,
    cycles: AtomicU64,
    seed: Option<u64>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StrategyStore>,
        market: Arc<dyn MarketDataClient>,
        account: Arc<dyn AccountSource>,
    ) -> Self {
        let registry = Arc::new(ArchetypeRegistry::with_defaults());
        let evaluator = FitnessEvaluator::new(config.min_sample_size, config.max_trades_per_window);
        let policy = PopulationPolicy {
            min_population: config.min_population,
            max_population: config.max_population,
            exploration_ratio: config.exploration_ratio,
            parent_cooldown: config.parent_cooldown(),
        };
        let cache = Arc::new(CacheLayer::new(
            account,
            config.cache_ttl(),
            config.fetch_timeout(),
        ));

        Self {
            operators: ReproductionOperators::new(registry),
            allocator: CapitalAllocator::new(AllocationPolicy::from_config(&config)),
            population: Mutex::new(PopulationManager::new(evaluator, policy)),
            population_gate: RwLock::new(()),
            simulation: SimulationConfig::default(),
            cycles: AtomicU64::new(0),
            paper: None,
            seed: None,
            config,
            store,
            market,
            cache,
        }
    }

    /// Engine backed by a paper account; reported trades settle into it
    pub fn with_paper_account(
        config: EngineConfig,
        store: Arc<dyn StrategyStore>,
        market: Arc<dyn MarketDataClient>,
        paper: Arc<PaperAccount>,
    ) -> Self {
        let mut engine = Self::new(config, store, market, paper.clone());
        engine.paper = Some(paper);
        engine
    }

    /// Deterministic reproduction, for tests and replays
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StrategyStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn registry(&self) -> &ArchetypeRegistry {
        self.operators.registry()
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Evolution cycle
    // ========================================================================

    /// Score, eliminate, breed and re-fund the population, then persist the
    /// result. Holds the population gate for the whole cycle.
    pub async fn run_evolution_cycle(&self) -> EngineResult<CycleReport> {
        let _gate = self.population_gate.write().await;
        let plan = self.plan_cycle().await?;
        self.commit_cycle(plan).await
    }

    /// Same as [`Engine::run_evolution_cycle`], but the cycle is abandoned if
    /// `shutdown` flips while it is still waiting for the gate, fetching or
    /// deciding. Nothing is written before that point; once writing starts
    /// the cycle runs to completion.
    pub async fn run_evolution_cycle_until(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> EngineResult<CycleReport> {
        let planning = async {
            let gate = self.population_gate.write().await;
            self.plan_cycle().await.map(|plan| (gate, plan))
        };
        let (_gate, plan) = tokio::select! {
            planned = planning => planned?,
            _ = shutdown_requested(&mut shutdown) => {
                info!("Evolution cycle cancelled before commit");
                return Err(EngineError::Cancelled("evolution cycle"));
            }
        };
        self.commit_cycle(plan).await
    }

    /// Everything a cycle decides, without side effects on the store.
    /// Caller holds the population gate.
    async fn plan_cycle(&self) -> EngineResult<CyclePlan> {
        let started = Instant::now();
        let now = Utc::now();
        let cycle = self.cycles.load(Ordering::Relaxed) + 1;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(cycle)),
            None => StdRng::from_entropy(),
        };
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        info!(cycle, "Evolution cycle starting");

        let mut population = self
            .bounded("list_strategies", self.store.list_strategies(&StrategyFilter::live()))
            .await?;

        self.refresh_live_stats(&mut population).await?;
        self.bootstrap_candidates(&mut population, &mut report).await;

        let mut manager = self.population.lock().await;
        let selection = manager.run_elimination_and_selection(population, now);
        report.threshold = selection.threshold;
        report.evaluated = selection.survivors.len() + selection.eliminated.len();
        report.eliminated = selection.eliminated.len();

        let mut events = selection.events;
        let mut survivors = selection.survivors;
        let eliminated = selection.eliminated;
        let pending = selection.pending;

        // Qualification gate
        let qualification = self.config.qualification_threshold;
        for record in survivors.iter_mut() {
            let qualified = record.fitness >= qualification;
            match record.stage {
                LifecycleStage::Simulated if qualified => {
                    record.transition(LifecycleStage::Qualified, now);
                    report.promoted += 1;
                    events.push(
                        EvolutionEvent::new(
                            &record.id,
                            EvolutionEventType::Promote,
                            format!(
                                "Qualified at fitness {:.1} (threshold {:.0})",
                                record.fitness, qualification
                            ),
                        )
                        .with_fitness(Some(record.fitness), Some(record.fitness)),
                    );
                }
                LifecycleStage::Qualified | LifecycleStage::Active if !qualified => {
                    record.transition(LifecycleStage::Simulated, now);
                    report.demoted += 1;
                    events.push(
                        EvolutionEvent::new(
                            &record.id,
                            EvolutionEventType::Demote,
                            format!(
                                "Fitness {:.1} fell below qualification threshold {:.0}",
                                record.fitness, qualification
                            ),
                        )
                        .with_fitness(Some(record.fitness), Some(record.fitness)),
                    );
                }
                _ => {}
            }
        }

        // Reproduction
        let occupied = survivors.len() + pending.len();
        let plan =
            manager.plan_reproduction(&survivors, &selection.elites, occupied, now, &mut rng);
        drop(manager);
        report.backfilled = plan.backfill;

        let mut offspring: Vec<Offspring> = Vec::with_capacity(plan.total());
        let mut used_parents: HashSet<String> = HashSet::new();

        for parent_id in &plan.mutations {
            let Some(parent) = survivors.iter().find(|r| &r.id == parent_id) else {
                continue;
            };
            match self.operators.mutate(parent, &mut rng) {
                Ok(child) => {
                    used_parents.insert(parent.id.clone());
                    offspring.push(child);
                }
                Err(e) => {
                    debug!(parent = %parent.id, error = %e, "Mutation rejected");
                    report.rejected_offspring += 1;
                }
            }
        }
        for (a_id, b_id) in &plan.crossovers {
            let a = survivors.iter().find(|r| &r.id == a_id);
            let b = survivors.iter().find(|r| &r.id == b_id);
            let (Some(a), Some(b)) = (a, b) else {
                continue;
            };
            match self.operators.crossover(a, b, &mut rng) {
                Ok(child) => {
                    used_parents.insert(a.id.clone());
                    used_parents.insert(b.id.clone());
                    offspring.push(child);
                }
                Err(e) => {
                    debug!(a = %a.id, b = %b.id, error = %e, "Crossover rejected");
                    report.rejected_offspring += 1;
                }
            }
        }
        let templates = SpawnTemplates {
            archetypes: self.registry().kinds(),
            symbols: self.config.symbols.clone(),
        };
        for _ in 0..plan.spawns {
            match self.operators.spawn_random(&templates, &mut rng) {
                Ok(child) => offspring.push(child),
                Err(e) => {
                    warn!(error = %e, "Random spawn failed");
                    report.rejected_offspring += 1;
                }
            }
        }
        for record in survivors.iter_mut() {
            if used_parents.contains(&record.id) {
                record.last_evolved_at = Some(now);
                record.updated_at = now;
            }
        }
        report.offspring = offspring.len();

        // Capital allocation against a fresh balance only
        match self.cache.balance().await {
            Ok(read) if !read.stale => {
                let plan = self.allocator.allocate(&survivors, read.value.available, now);
                let allocation_events = self.allocator.apply(&plan, &mut survivors, now);
                report.funded = plan.allocations.len();
                report.allocated = plan.total_allocated;
                report.promoted += allocation_events
                    .iter()
                    .filter(|e| e.event_type == EvolutionEventType::Promote)
                    .count();
                report.demoted += allocation_events
                    .iter()
                    .filter(|e| e.event_type == EvolutionEventType::Demote)
                    .count();
                events.extend(allocation_events);
            }
            Ok(read) => {
                let reason = format!(
                    "balance is stale ({})",
                    read.error.unwrap_or_else(|| "refresh failed".to_string())
                );
                warn!(cycle, %reason, "Keeping previous allocations");
                report.allocation_skipped = Some(reason);
            }
            Err(e) => {
                warn!(cycle, error = %e, "Keeping previous allocations");
                report.allocation_skipped = Some(e.to_string());
            }
        }
        report.survivors = survivors.len();

        let mut records = eliminated;
        records.extend(survivors);
        records.extend(pending);
        Ok(CyclePlan {
            report,
            started,
            records,
            offspring,
            events,
        })
    }

    /// Persist a planned cycle: records first, then the audit trail in
    /// decision order.
    async fn commit_cycle(&self, plan: CyclePlan) -> EngineResult<CycleReport> {
        let CyclePlan {
            mut report,
            started,
            records,
            offspring,
            mut events,
        } = plan;
        let cycle = report.cycle;
        self.cycles.fetch_add(1, Ordering::Relaxed);

        for record in &records {
            self.bounded("save_strategy", self.store.save_strategy(record)).await?;
        }
        for child in &offspring {
            self.bounded("save_strategy", self.store.save_strategy(&child.record))
                .await?;
        }
        events.extend(offspring.into_iter().map(|child| child.event));
        for event in &events {
            self.bounded("append_evolution_event", self.store.append_evolution_event(event))
                .await?;
        }
        report.events = events.len();
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            cycle,
            threshold = report.threshold,
            survivors = report.survivors,
            eliminated = report.eliminated,
            offspring = report.offspring,
            funded = report.funded,
            allocated = %report.allocated,
            events = report.events,
            duration_ms = report.duration_ms,
            "Evolution cycle complete"
        );

        Ok(report)
    }

    /// Replace stats with ones computed from recorded trades once enough exist
    async fn refresh_live_stats(&self, population: &mut [StrategyRecord]) -> EngineResult<()> {
        for record in population.iter_mut() {
            if record.stage == LifecycleStage::Candidate {
                continue;
            }
            let trades = self
                .bounded("list_trades", self.store.list_trades(&record.id))
                .await?;
            if (trades.len() as u64) < u64::from(self.config.min_sample_size) {
                continue;
            }
            let allocation = record.allocation.as_ref().map(|a| a.amount);
            record.stats = live_stats(&trades, allocation);
            debug!(
                strategy = %record.id,
                trades = trades.len(),
                win_rate = record.stats.win_rate,
                "Live stats refreshed"
            );
        }
        Ok(())
    }

    /// Simulate every candidate over a recent window. Candidates whose
    /// window is unavailable stay candidates until the next cycle.
    async fn bootstrap_candidates(&self, population: &mut [StrategyRecord], report: &mut CycleReport) {
        let symbols: HashSet<String> = population
            .iter()
            .filter(|r| r.stage == LifecycleStage::Candidate)
            .map(|r| r.symbol.clone())
            .collect();
        if symbols.is_empty() {
            return;
        }

        let mut windows: HashMap<String, Vec<Kline>> = HashMap::new();
        for symbol in symbols {
            if let Some(window) = self.fetch_window(&symbol, self.config.simulation_bars).await {
                windows.insert(symbol, window);
            }
        }

        let now = Utc::now();
        for record in population
            .iter_mut()
            .filter(|r| r.stage == LifecycleStage::Candidate)
        {
            let Some(window) = windows.get(&record.symbol) else {
                report.insufficient_data += 1;
                continue;
            };
            let Some(archetype) = self.registry().get(record.archetype) else {
                warn!(strategy = %record.id, archetype = record.archetype.as_str(), "No archetype registered");
                continue;
            };
            match Simulator::run(archetype.as_ref(), &record.parameters, window, &self.simulation) {
                Ok(sim) => {
                    debug!(
                        strategy = %record.id,
                        trades = sim.stats.trade_count,
                        total_return = sim.stats.total_return,
                        "Candidate simulated"
                    );
                    record.stats = sim.stats;
                    record.transition(LifecycleStage::Simulated, now);
                    report.simulated += 1;
                }
                Err(SimulationError::InsufficientData { needed, available }) => {
                    debug!(strategy = %record.id, needed, available, "Window too short to simulate");
                    report.insufficient_data += 1;
                }
                Err(e) => {
                    warn!(strategy = %record.id, error = %e, "Simulation failed");
                    report.insufficient_data += 1;
                }
            }
        }
    }

    // ========================================================================
    // Signal cycle
    // ========================================================================

    /// Ask every Active strategy for a signal on its latest window
    pub async fn run_signal_cycle(&self) -> EngineResult<SignalReport> {
        let _gate = self.population_gate.read().await;
        let active = self
            .bounded(
                "list_strategies",
                self.store
                    .list_strategies(&StrategyFilter::stage(LifecycleStage::Active)),
            )
            .await?;

        let mut report = SignalReport {
            active: active.len(),
            ..Default::default()
        };
        for record in &active {
            match self.signal_for(record).await {
                SignalOutcome::Emitted(signal) => {
                    let inserted = self
                        .bounded("append_signal", self.store.append_signal(&signal))
                        .await?;
                    if inserted {
                        info!(
                            strategy = %signal.strategy_id,
                            symbol = %signal.symbol,
                            side = signal.side.as_str(),
                            price = %signal.price,
                            quantity = %signal.quantity,
                            confidence = signal.confidence,
                            "Signal emitted"
                        );
                        report.emitted += 1;
                    } else {
                        report.duplicates += 1;
                    }
                }
                SignalOutcome::NoSignal => report.idle += 1,
                SignalOutcome::InsufficientData(reason) => {
                    debug!(strategy = %record.id, %reason, "No signal: insufficient data");
                    report.insufficient_data += 1;
                }
                SignalOutcome::Invalid(reason) => {
                    warn!(strategy = %record.id, %reason, "Strategy cannot produce signals");
                    report.invalid += 1;
                }
            }
        }

        debug!(
            active = report.active,
            emitted = report.emitted,
            insufficient = report.insufficient_data,
            "Signal cycle complete"
        );
        Ok(report)
    }

    /// Signal for one Active strategy. Missing market data is reported, never filled in.
    pub async fn signal_for(&self, record: &StrategyRecord) -> SignalOutcome {
        let Some(archetype) = self.registry().get(record.archetype) else {
            return SignalOutcome::Invalid(format!("unknown archetype {}", record.archetype.as_str()));
        };
        let Some(allocation) = record.allocation.as_ref() else {
            return SignalOutcome::Invalid("active without allocation".to_string());
        };

        let Some(window) = self
            .fetch_window(&record.symbol, self.config.signal_window_bars)
            .await
        else {
            return SignalOutcome::InsufficientData(format!("no klines for {}", record.symbol));
        };
        let Some(last_bar) = window.last() else {
            return SignalOutcome::InsufficientData("empty window".to_string());
        };

        let intent = match archetype.generate_signal(&record.parameters, &window) {
            Ok(Some(intent)) => intent,
            Ok(None) => return SignalOutcome::NoSignal,
            Err(SignalError::InsufficientData { needed, available }) => {
                return SignalOutcome::InsufficientData(format!(
                    "need {needed} bars, have {available}"
                ))
            }
            Err(e) => return SignalOutcome::Invalid(e.to_string()),
        };

        let price = match tokio::time::timeout(
            self.config.fetch_timeout(),
            self.market.get_price(&record.symbol),
        )
        .await
        {
            Ok(Some(price)) => price,
            Ok(None) => {
                return SignalOutcome::InsufficientData(format!("no price for {}", record.symbol))
            }
            Err(_) => {
                return SignalOutcome::InsufficientData(format!(
                    "price fetch for {} timed out",
                    record.symbol
                ))
            }
        };

        let confidence = Decimal::from_f64(intent.confidence)
            .map(|c| c.round_dp(4))
            .unwrap_or(Decimal::ZERO);
        let quantity = (allocation.amount * confidence / price)
            .round_dp_with_strategy(6, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return SignalOutcome::Invalid(format!(
                "allocation {} too small for price {}",
                allocation.amount, price
            ));
        }

        SignalOutcome::Emitted(Signal {
            // One signal per strategy, bar and side
            id: format!(
                "SIG_{}_{}_{}",
                record.id,
                last_bar.close_time,
                intent.side.as_str()
            ),
            strategy_id: record.id.clone(),
            symbol: record.symbol.clone(),
            side: intent.side,
            price,
            quantity,
            confidence: intent.confidence,
            timestamp: Utc::now(),
            executed: false,
        })
    }

    // ========================================================================
    // Fills and account state
    // ========================================================================

    /// Ingest an opening fill. The paper account takes on the exposure and
    /// the originating signal, if any, is marked executed.
    pub async fn record_entry(&self, entry: &EntryFill) -> EngineResult<()> {
        if self
            .bounded("get_strategy", self.store.get_strategy(&entry.strategy_id))
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(entry.strategy_id.clone()));
        }

        if let Some(signal_id) = entry.signal_id.as_deref() {
            let marked = self
                .bounded("mark_signal_executed", self.store.mark_signal_executed(signal_id))
                .await?;
            if !marked {
                warn!(signal = signal_id, "Entry references an unknown or executed signal");
            }
        }
        if let Some(paper) = &self.paper {
            paper
                .apply_fill(&entry.symbol, entry.side, entry.quantity, entry.price)
                .await;
        }
        self.cache
            .invalidate(CacheKey::Balance, InvalidationReason::TradeExecuted);
        self.cache
            .invalidate(CacheKey::Positions, InvalidationReason::TradeExecuted);

        info!(
            strategy = %entry.strategy_id,
            symbol = %entry.symbol,
            side = entry.side.as_str(),
            quantity = %entry.quantity,
            price = %entry.price,
            "Entry recorded"
        );
        Ok(())
    }

    /// Ingest a closed trade from the execution side. The trade is appended
    /// to the strategy's history and cached account state is invalidated.
    pub async fn record_fill(
        &self,
        trade: TradeRecord,
        signal_id: Option<&str>,
    ) -> EngineResult<i64> {
        if self
            .bounded("get_strategy", self.store.get_strategy(&trade.strategy_id))
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(trade.strategy_id));
        }

        let id = self
            .bounded("append_trade", self.store.append_trade(&trade))
            .await?;
        if let Some(signal_id) = signal_id {
            let marked = self
                .bounded("mark_signal_executed", self.store.mark_signal_executed(signal_id))
                .await?;
            if !marked {
                warn!(signal = signal_id, "Fill references an unknown or executed signal");
            }
        }
        if let Some(paper) = &self.paper {
            paper.settle(&trade).await;
        }
        self.cache
            .invalidate(CacheKey::Balance, InvalidationReason::TradeExecuted);
        self.cache
            .invalidate(CacheKey::Positions, InvalidationReason::TradeExecuted);

        info!(
            strategy = %trade.strategy_id,
            trade_id = id,
            pnl = %trade.pnl,
            "Fill recorded"
        );
        Ok(id)
    }

    /// Move cash into (positive) or out of (negative) the paper account.
    /// Returns false when the engine is wired to a live account.
    pub async fn transfer_paper_funds(&self, amount: Decimal) -> bool {
        let Some(paper) = &self.paper else {
            return false;
        };
        if amount >= Decimal::ZERO {
            paper.deposit(amount).await;
        } else {
            paper.withdraw(-amount).await;
        }
        self.cache
            .invalidate(CacheKey::Balance, InvalidationReason::DepositWithdrawal);
        info!(%amount, "Paper funds transferred");
        true
    }

    pub fn invalidate_account(&self, reason: InvalidationReason) {
        self.cache.invalidate_all(reason);
    }

    /// Warm both account keys. Returns the cache status afterwards.
    pub async fn refresh_account_cache(&self) -> Vec<CacheStatus> {
        match self.cache.balance().await {
            Ok(read) if read.stale => warn!(error = ?read.error, "Serving stale balance"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Balance unavailable"),
        }
        match self.cache.positions().await {
            Ok(read) if read.stale => warn!(error = ?read.error, "Serving stale positions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Positions unavailable"),
        }
        self.cache.status().await
    }

    /// Current population, best first
    pub async fn population_snapshot(&self, include_eliminated: bool) -> EngineResult<Vec<StrategyRecord>> {
        let filter = StrategyFilter {
            include_eliminated,
            ..Default::default()
        };
        self.bounded("list_strategies", self.store.list_strategies(&filter))
            .await
    }

    pub async fn evolution_history(&self, strategy_id: &str) -> EngineResult<Vec<EvolutionEvent>> {
        self.bounded(
            "list_evolution_events",
            self.store.list_evolution_events(strategy_id),
        )
        .await
    }

    /// Latest evolution decisions across the population, newest first
    pub async fn recent_events(&self, limit: usize) -> EngineResult<Vec<EvolutionEvent>> {
        self.bounded(
            "recent_evolution_events",
            self.store.recent_evolution_events(limit),
        )
        .await
    }

    /// Stored strategies per lifecycle stage
    pub async fn stage_counts(&self) -> EngineResult<BTreeMap<String, usize>> {
        self.bounded("count_by_stage", self.store.count_by_stage())
            .await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn fetch_window(&self, symbol: &str, bars: u32) -> Option<Vec<Kline>> {
        let fetch = self
            .market
            .get_window(symbol, &self.config.kline_interval, bars as usize);
        match tokio::time::timeout(self.config.fetch_timeout(), fetch).await {
            Ok(window) => window,
            Err(_) => {
                warn!(symbol, "Kline fetch timed out");
                None
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = EngineResult<T>>,
    ) -> EngineResult<T> {
        let timeout = self.config.fetch_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout {
                operation,
                seconds: timeout.as_secs(),
            })?
    }
}
