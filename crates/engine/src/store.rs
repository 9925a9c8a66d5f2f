//! Strategy store: the persistence boundary of the engine
//!
//! `SqliteStrategyStore` maps domain records onto the persistence crate's
//! repositories. `MemoryStore` keeps everything in process for tests and
//! dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::repository::{
    EvolutionEventRow, EvolutionRepository, SignalRepository, SignalRow, StrategyQuery,
    StrategyRepository, StrategyRow, TradeRepository, TradeRow,
};
use persistence::SqlitePool;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    ArchetypeKind, EvolutionEvent, EvolutionEventType, LifecycleStage, Signal, StrategyRecord,
    TradeRecord, TradeSide,
};

/// Which strategies to list
#[derive(Debug, Clone, Default)]
pub struct StrategyFilter {
    /// Empty = any stage
    pub stages: Vec<LifecycleStage>,
    pub symbol: Option<String>,
    pub include_eliminated: bool,
}

impl StrategyFilter {
    /// Every live (non-eliminated) strategy
    pub fn live() -> Self {
        Self::default()
    }

    pub fn stage(stage: LifecycleStage) -> Self {
        Self {
            stages: vec![stage],
            ..Default::default()
        }
    }

    fn matches(&self, record: &StrategyRecord) -> bool {
        (self.include_eliminated || !record.is_eliminated())
            && (self.stages.is_empty() || self.stages.contains(&record.stage))
            && self.symbol.as_ref().map_or(true, |s| *s == record.symbol)
    }
}

#[derive(Debug, Clone)]
pub struct SignalFilter {
    pub strategy_id: Option<String>,
    pub pending_only: bool,
    pub limit: usize,
}

impl Default for SignalFilter {
    fn default() -> Self {
        Self {
            strategy_id: None,
            pending_only: false,
            limit: 100,
        }
    }
}

#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// Best fitness first
    async fn list_strategies(&self, filter: &StrategyFilter) -> EngineResult<Vec<StrategyRecord>>;
    async fn get_strategy(&self, id: &str) -> EngineResult<Option<StrategyRecord>>;
    async fn save_strategy(&self, record: &StrategyRecord) -> EngineResult<()>;

    /// Append to the audit log, returning the commit sequence
    async fn append_evolution_event(&self, event: &EvolutionEvent) -> EngineResult<i64>;
    /// Events for one strategy in sequence order
    async fn list_evolution_events(&self, strategy_id: &str) -> EngineResult<Vec<EvolutionEvent>>;
    /// Latest events across the population, newest first
    async fn recent_evolution_events(&self, limit: usize) -> EngineResult<Vec<EvolutionEvent>>;
    /// Number of stored strategies per lifecycle stage, eliminated included
    async fn count_by_stage(&self) -> EngineResult<BTreeMap<String, usize>>;

    /// Returns false when a signal with the same id already exists
    async fn append_signal(&self, signal: &Signal) -> EngineResult<bool>;
    /// Newest first
    async fn list_signals(&self, filter: &SignalFilter) -> EngineResult<Vec<Signal>>;
    async fn mark_signal_executed(&self, id: &str) -> EngineResult<bool>;

    async fn append_trade(&self, trade: &TradeRecord) -> EngineResult<i64>;
    /// Trades for one strategy in closing order
    async fn list_trades(&self, strategy_id: &str) -> EngineResult<Vec<TradeRecord>>;
}

fn sort_best_first(records: &mut [StrategyRecord]) {
    records.sort_by(|a, b| {
        b.fitness
            .total_cmp(&a.fitness)
            .then(a.created_at.cmp(&b.created_at))
    });
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    strategies: BTreeMap<String, StrategyRecord>,
    events: Vec<EvolutionEvent>,
    signals: Vec<Signal>,
    trades: Vec<TradeRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn list_strategies(&self, filter: &StrategyFilter) -> EngineResult<Vec<StrategyRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .strategies
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_best_first(&mut records);
        Ok(records)
    }

    async fn get_strategy(&self, id: &str) -> EngineResult<Option<StrategyRecord>> {
        Ok(self.state.lock().await.strategies.get(id).cloned())
    }

    async fn save_strategy(&self, record: &StrategyRecord) -> EngineResult<()> {
        self.state
            .lock()
            .await
            .strategies
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn append_evolution_event(&self, event: &EvolutionEvent) -> EngineResult<i64> {
        let mut state = self.state.lock().await;
        let sequence = state.events.len() as i64 + 1;
        let mut stored = event.clone();
        stored.sequence = Some(sequence);
        state.events.push(stored);
        Ok(sequence)
    }

    async fn list_evolution_events(&self, strategy_id: &str) -> EngineResult<Vec<EvolutionEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.strategy_id == strategy_id)
            .cloned()
            .collect())
    }

    async fn recent_evolution_events(&self, limit: usize) -> EngineResult<Vec<EvolutionEvent>> {
        let state = self.state.lock().await;
        Ok(state.events.iter().rev().take(limit).cloned().collect())
    }

    async fn count_by_stage(&self) -> EngineResult<BTreeMap<String, usize>> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for record in state.strategies.values() {
            *counts.entry(record.stage.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn append_signal(&self, signal: &Signal) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        if state.signals.iter().any(|s| s.id == signal.id) {
            return Ok(false);
        }
        state.signals.push(signal.clone());
        Ok(true)
    }

    async fn list_signals(&self, filter: &SignalFilter) -> EngineResult<Vec<Signal>> {
        let state = self.state.lock().await;
        let mut signals: Vec<Signal> = state
            .signals
            .iter()
            .filter(|s| filter.strategy_id.as_ref().map_or(true, |id| *id == s.strategy_id))
            .filter(|s| !filter.pending_only || !s.executed)
            .cloned()
            .collect();
        signals.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        signals.truncate(filter.limit);
        Ok(signals)
    }

    async fn mark_signal_executed(&self, id: &str) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        match state.signals.iter_mut().find(|s| s.id == id && !s.executed) {
            Some(signal) => {
                signal.executed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_trade(&self, trade: &TradeRecord) -> EngineResult<i64> {
        let mut state = self.state.lock().await;
        let id = state.trades.len() as i64 + 1;
        let mut stored = trade.clone();
        stored.id = Some(id);
        state.trades.push(stored);
        Ok(id)
    }

    async fn list_trades(&self, strategy_id: &str) -> EngineResult<Vec<TradeRecord>> {
        let state = self.state.lock().await;
        let mut trades: Vec<_> = state
            .trades
            .iter()
            .filter(|t| t.strategy_id == strategy_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| a.closed_at.cmp(&b.closed_at).then(a.id.cmp(&b.id)));
        Ok(trades)
    }
}

// ============================================================================
// SQLite store
// ============================================================================

pub struct SqliteStrategyStore {
    pool: SqlitePool,
}

impl SqliteStrategyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StrategyStore for SqliteStrategyStore {
    async fn list_strategies(&self, filter: &StrategyFilter) -> EngineResult<Vec<StrategyRecord>> {
        let query = StrategyQuery {
            stages: filter.stages.iter().map(|s| s.as_str().to_string()).collect(),
            symbol: filter.symbol.clone(),
            include_disabled: filter.include_eliminated,
        };
        let rows = StrategyRepository::new(&self.pool).list(&query).await?;
        let mut records = rows
            .into_iter()
            .map(record_from_row)
            .collect::<EngineResult<Vec<_>>>()?;
        // Stage is authoritative, `enabled` only narrows the query
        records.retain(|r| filter.matches(r));
        Ok(records)
    }

    async fn get_strategy(&self, id: &str) -> EngineResult<Option<StrategyRecord>> {
        StrategyRepository::new(&self.pool)
            .get(id)
            .await?
            .map(record_from_row)
            .transpose()
    }

    async fn save_strategy(&self, record: &StrategyRecord) -> EngineResult<()> {
        let row = row_from_record(record)?;
        StrategyRepository::new(&self.pool).upsert(&row).await?;
        Ok(())
    }

    async fn append_evolution_event(&self, event: &EvolutionEvent) -> EngineResult<i64> {
        let row = EvolutionEventRow {
            sequence: None,
            strategy_id: event.strategy_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            old_parameters: event
                .old_parameters
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            new_parameters: event
                .new_parameters
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            old_fitness: event.old_fitness,
            new_fitness: event.new_fitness,
            reason: event.reason.clone(),
            created_at: event.timestamp.timestamp_millis(),
        };
        Ok(EvolutionRepository::new(&self.pool).append(&row).await?)
    }

    async fn list_evolution_events(&self, strategy_id: &str) -> EngineResult<Vec<EvolutionEvent>> {
        let rows = EvolutionRepository::new(&self.pool)
            .list_for_strategy(strategy_id)
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn recent_evolution_events(&self, limit: usize) -> EngineResult<Vec<EvolutionEvent>> {
        let rows = EvolutionRepository::new(&self.pool)
            .recent(limit as i64)
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn count_by_stage(&self) -> EngineResult<BTreeMap<String, usize>> {
        let rows = StrategyRepository::new(&self.pool).count_by_stage().await?;
        rows.into_iter()
            .map(|(stage, count)| -> EngineResult<(String, usize)> {
                let stage = LifecycleStage::parse(&stage)
                    .ok_or_else(|| invalid("strategies", format!("unknown stage {stage}")))?;
                Ok((stage.as_str().to_string(), usize::try_from(count).unwrap_or(0)))
            })
            .collect()
    }

    async fn append_signal(&self, signal: &Signal) -> EngineResult<bool> {
        let row = SignalRow {
            id: signal.id.clone(),
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side.as_str().to_string(),
            price: signal.price.to_string(),
            quantity: signal.quantity.to_string(),
            confidence: signal.confidence,
            executed: signal.executed,
            created_at: signal.timestamp.timestamp_millis(),
        };
        Ok(SignalRepository::new(&self.pool).insert(&row).await?)
    }

    async fn list_signals(&self, filter: &SignalFilter) -> EngineResult<Vec<Signal>> {
        let rows = SignalRepository::new(&self.pool)
            .list(
                filter.strategy_id.as_deref(),
                filter.pending_only,
                filter.limit as i64,
            )
            .await?;
        rows.into_iter().map(signal_from_row).collect()
    }

    async fn mark_signal_executed(&self, id: &str) -> EngineResult<bool> {
        Ok(SignalRepository::new(&self.pool).mark_executed(id).await?)
    }

    async fn append_trade(&self, trade: &TradeRecord) -> EngineResult<i64> {
        let row = TradeRow {
            id: None,
            strategy_id: trade.strategy_id.clone(),
            symbol: trade.symbol.clone(),
            side: trade.side.as_str().to_string(),
            entry_price: trade.entry_price.to_string(),
            exit_price: trade.exit_price.to_string(),
            quantity: trade.quantity.to_string(),
            pnl: trade.pnl.to_string(),
            pnl_pct: trade.pnl_pct,
            opened_at: trade.opened_at.timestamp_millis(),
            closed_at: trade.closed_at.timestamp_millis(),
        };
        Ok(TradeRepository::new(&self.pool).append(&row).await?)
    }

    async fn list_trades(&self, strategy_id: &str) -> EngineResult<Vec<TradeRecord>> {
        let rows = TradeRepository::new(&self.pool)
            .list_for_strategy(strategy_id)
            .await?;
        rows.into_iter().map(trade_from_row).collect()
    }
}

// ============================================================================
// Row conversion
// ============================================================================

fn row_from_record(record: &StrategyRecord) -> EngineResult<StrategyRow> {
    Ok(StrategyRow {
        id: record.id.clone(),
        archetype: record.archetype.as_str().to_string(),
        symbol: record.symbol.clone(),
        parameters: serde_json::to_string(&record.parameters)?,
        generation: record.generation as i64,
        round: record.round as i64,
        stage: record.stage.as_str().to_string(),
        enabled: record.enabled,
        fitness: record.fitness,
        stats: serde_json::to_string(&record.stats)?,
        parent_ids: serde_json::to_string(&record.parent_ids)?,
        allocation: record
            .allocation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        last_evolved_at: record.last_evolved_at.map(|t| t.timestamp_millis()),
        created_at: record.created_at.timestamp_millis(),
        updated_at: record.updated_at.timestamp_millis(),
    })
}

fn record_from_row(row: StrategyRow) -> EngineResult<StrategyRecord> {
    let archetype = ArchetypeKind::parse(&row.archetype)
        .ok_or_else(|| EngineError::UnknownArchetype(row.archetype.clone()))?;
    let stage = LifecycleStage::parse(&row.stage)
        .ok_or_else(|| invalid(&row.id, format!("unknown stage {}", row.stage)))?;

    Ok(StrategyRecord {
        archetype,
        symbol: row.symbol,
        parameters: serde_json::from_str(&row.parameters)?,
        generation: u32::try_from(row.generation).unwrap_or(0),
        round: u32::try_from(row.round).unwrap_or(0),
        stage,
        enabled: row.enabled,
        fitness: row.fitness,
        stats: serde_json::from_str(&row.stats)?,
        parent_ids: serde_json::from_str(&row.parent_ids)?,
        allocation: row
            .allocation
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        last_evolved_at: row
            .last_evolved_at
            .map(|ms| millis(&row.id, ms))
            .transpose()?,
        created_at: millis(&row.id, row.created_at)?,
        updated_at: millis(&row.id, row.updated_at)?,
        id: row.id,
    })
}

fn event_from_row(row: EvolutionEventRow) -> EngineResult<EvolutionEvent> {
    let event_type = EvolutionEventType::parse(&row.event_type)
        .ok_or_else(|| invalid(&row.strategy_id, format!("unknown event type {}", row.event_type)))?;
    Ok(EvolutionEvent {
        sequence: row.sequence,
        event_type,
        old_parameters: row
            .old_parameters
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        new_parameters: row
            .new_parameters
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        old_fitness: row.old_fitness,
        new_fitness: row.new_fitness,
        reason: row.reason,
        timestamp: millis(&row.strategy_id, row.created_at)?,
        strategy_id: row.strategy_id,
    })
}

fn signal_from_row(row: SignalRow) -> EngineResult<Signal> {
    Ok(Signal {
        side: side(&row.id, &row.side)?,
        price: decimal(&row.id, &row.price)?,
        quantity: decimal(&row.id, &row.quantity)?,
        timestamp: millis(&row.id, row.created_at)?,
        confidence: row.confidence,
        executed: row.executed,
        strategy_id: row.strategy_id,
        symbol: row.symbol,
        id: row.id,
    })
}

fn trade_from_row(row: TradeRow) -> EngineResult<TradeRecord> {
    let key = &row.strategy_id;
    Ok(TradeRecord {
        id: row.id,
        side: side(key, &row.side)?,
        entry_price: decimal(key, &row.entry_price)?,
        exit_price: decimal(key, &row.exit_price)?,
        quantity: decimal(key, &row.quantity)?,
        pnl: decimal(key, &row.pnl)?,
        pnl_pct: row.pnl_pct,
        opened_at: millis(key, row.opened_at)?,
        closed_at: millis(key, row.closed_at)?,
        symbol: row.symbol.clone(),
        strategy_id: row.strategy_id.clone(),
    })
}

fn invalid(id: &str, reason: String) -> EngineError {
    EngineError::InvalidRecord {
        id: id.to_string(),
        reason,
    }
}

fn millis(id: &str, ms: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| invalid(id, format!("bad timestamp {ms}")))
}

fn decimal(id: &str, raw: &str) -> EngineResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| invalid(id, format!("bad decimal {raw}: {e}")))
}

fn side(id: &str, raw: &str) -> EngineResult<TradeSide> {
    TradeSide::parse(raw).ok_or_else(|| invalid(id, format!("unknown side {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AllocationTier, CapitalAllocation, Parameters};
    use persistence::Database;
    use rust_decimal_macros::dec;

    fn record(id: &str, fitness: f64) -> StrategyRecord {
        let mut params = Parameters::new();
        params.insert("lookback".to_string(), 20.0);
        params.insert("entry_threshold".to_string(), 1.5);
        let mut r = StrategyRecord::candidate(
            id.to_string(),
            ArchetypeKind::Momentum,
            "BTCUSDT".to_string(),
            params,
            2,
            vec!["PARENT".to_string()],
        );
        r.fitness = fitness;
        r
    }

    async fn exercise_store(store: &dyn StrategyStore) {
        let mut active = record("A", 91.0);
        active.stage = LifecycleStage::Active;
        active.allocation = Some(CapitalAllocation {
            strategy_id: "A".to_string(),
            tier: AllocationTier::Legendary,
            ratio: 1.0,
            amount: dec!(950.50),
            computed_at: Utc::now(),
        });
        store.save_strategy(&active).await.unwrap();
        store.save_strategy(&record("B", 40.0)).await.unwrap();
        let mut gone = record("C", 10.0);
        gone.transition(LifecycleStage::Eliminated, Utc::now());
        store.save_strategy(&gone).await.unwrap();

        let live = store.list_strategies(&StrategyFilter::live()).await.unwrap();
        assert_eq!(live.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);

        let all = store
            .list_strategies(&StrategyFilter {
                include_eliminated: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let actives = store
            .list_strategies(&StrategyFilter::stage(LifecycleStage::Active))
            .await
            .unwrap();
        assert_eq!(actives.len(), 1);
        let loaded = &actives[0];
        assert_eq!(loaded.parameters, active.parameters);
        assert_eq!(loaded.parent_ids, vec!["PARENT".to_string()]);
        assert_eq!(loaded.allocation.as_ref().map(|a| a.amount), Some(dec!(950.50)));

        let e1 = store
            .append_evolution_event(&EvolutionEvent::new("A", EvolutionEventType::Spawn, "spawned"))
            .await
            .unwrap();
        let e2 = store
            .append_evolution_event(
                &EvolutionEvent::new("A", EvolutionEventType::Promote, "funded")
                    .with_fitness(Some(91.0), Some(91.0)),
            )
            .await
            .unwrap();
        assert!(e2 > e1);
        let events = store.list_evolution_events("A").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EvolutionEventType::Promote);
        assert_eq!(events[1].sequence, Some(e2));
        store
            .append_evolution_event(&EvolutionEvent::new("B", EvolutionEventType::Survive, "kept"))
            .await
            .unwrap();
        let recent = store.recent_evolution_events(2).await.unwrap();
        assert_eq!(
            recent.iter().map(|e| e.strategy_id.as_str()).collect::<Vec<_>>(),
            vec!["B", "A"]
        );
        assert_eq!(recent[1].event_type, EvolutionEventType::Promote);

        let counts = store.count_by_stage().await.unwrap();
        assert_eq!(counts.get("active"), Some(&1));
        assert_eq!(counts.get("eliminated"), Some(&1));
        assert_eq!(counts.values().sum::<usize>(), 3);

        let signal = Signal {
            id: "SIG1".to_string(),
            strategy_id: "A".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Buy,
            price: dec!(50000.5),
            quantity: dec!(0.019),
            confidence: 0.8,
            timestamp: Utc::now(),
            executed: false,
        };
        assert!(store.append_signal(&signal).await.unwrap());
        assert!(!store.append_signal(&signal).await.unwrap());
        let pending = store
            .list_signals(&SignalFilter {
                pending_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].price, dec!(50000.5));
        assert!(store.mark_signal_executed("SIG1").await.unwrap());
        assert!(!store.mark_signal_executed("SIG1").await.unwrap());

        let now = Utc::now();
        let trade = TradeRecord {
            id: None,
            strategy_id: "A".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Buy,
            entry_price: dec!(100),
            exit_price: dec!(110),
            quantity: dec!(2),
            pnl: dec!(20),
            pnl_pct: 10.0,
            opened_at: now,
            closed_at: now,
        };
        store.append_trade(&trade).await.unwrap();
        let trades = store.list_trades("A").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl, dec!(20));
        assert!(trades[0].id.is_some());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let db = Database::in_memory().await.unwrap();
        exercise_store(&SqliteStrategyStore::new(db.pool_clone())).await;
    }

    #[tokio::test]
    async fn test_unknown_archetype_row_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteStrategyStore::new(db.pool_clone());
        let mut row = row_from_record(&record("X", 50.0)).unwrap();
        row.archetype = "astrology".to_string();
        StrategyRepository::new(db.pool()).upsert(&row).await.unwrap();

        let err = store.get_strategy("X").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownArchetype(ref a) if a == "astrology"));
    }
}
