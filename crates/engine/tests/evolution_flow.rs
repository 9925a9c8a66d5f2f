//! End-to-end: evolution, signal generation and fill ingest on a SQLite store

use async_trait::async_trait;
use chrono::Utc;
use engine::{
    ArchetypeKind, Engine, EngineConfig, EvolutionEventType, Kline, LifecycleStage,
    MarketDataClient, PaperAccount, Parameters, SignalFilter, SqliteStrategyStore, StatsSnapshot,
    StrategyFilter, StrategyRecord, StrategyStore, TradeRecord, TradeSide,
};
use persistence::Database;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

/// Flat tape that rallies on the final bars
struct RallyMarket {
    klines: Vec<Kline>,
}

impl RallyMarket {
    fn new() -> Self {
        let mut prices = vec![100.0; 200];
        prices.extend((1..=30).map(|i| 100.0 * 1.01_f64.powi(i)));
        let klines = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
                Kline {
                    open_time: (i as i64) * 900_000,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: dec!(100),
                    close_time: ((i + 1) as i64) * 900_000 - 1,
                }
            })
            .collect();
        Self { klines }
    }
}

#[async_trait]
impl MarketDataClient for RallyMarket {
    async fn get_price(&self, _symbol: &str) -> Option<Decimal> {
        self.klines.last().map(|k| k.close)
    }

    async fn get_window(&self, _symbol: &str, _interval: &str, bars: usize) -> Option<Vec<Kline>> {
        let start = self.klines.len().saturating_sub(bars);
        Some(self.klines[start..].to_vec())
    }
}

fn strategy(id: &str, stats: StatsSnapshot) -> StrategyRecord {
    let mut params = Parameters::new();
    params.insert("lookback".to_string(), 20.0);
    params.insert("entry_threshold".to_string(), 1.5);
    let mut record = StrategyRecord::candidate(
        id.to_string(),
        ArchetypeKind::Momentum,
        "BTCUSDT".to_string(),
        params,
        1,
        Vec::new(),
    );
    record.stage = LifecycleStage::Simulated;
    record.stats = stats;
    record
}

fn strong() -> StatsSnapshot {
    StatsSnapshot {
        win_rate: 0.8,
        total_return: 0.3,
        sharpe_ratio: 3.0,
        max_drawdown: 0.03,
        profit_factor: 3.5,
        trade_count: 40,
    }
}

fn mediocre() -> StatsSnapshot {
    StatsSnapshot {
        win_rate: 0.6,
        total_return: 0.05,
        sharpe_ratio: 1.0,
        max_drawdown: 0.10,
        profit_factor: 1.5,
        trade_count: 30,
    }
}

#[tokio::test]
async fn test_population_evolves_funds_and_trades() {
    let db = Database::in_memory().await.unwrap();
    let store = Arc::new(SqliteStrategyStore::new(db.pool_clone()));
    for i in 0..6 {
        store.save_strategy(&strategy(&format!("ELITE{i}"), strong())).await.unwrap();
    }
    for i in 0..14 {
        store.save_strategy(&strategy(&format!("MID{i:02}"), mediocre())).await.unwrap();
    }

    let config = EngineConfig::default();
    let max_population = config.max_population;
    let engine = Engine::with_paper_account(
        config,
        store.clone(),
        Arc::new(RallyMarket::new()),
        Arc::new(PaperAccount::new(dec!(1000))),
    )
    .with_seed(42);

    // Evolution: 6 strong strategies ratchet the threshold to 75
    let report = engine.run_evolution_cycle().await.unwrap();
    assert_eq!(report.threshold, 75.0);
    assert_eq!(report.survivors, 6);
    assert_eq!(report.eliminated, 14);
    assert_eq!(report.funded, 6);
    assert!(report.allocated <= dec!(1000));

    let live = store.list_strategies(&StrategyFilter::live()).await.unwrap();
    assert_eq!(live.len(), max_population);
    let active = store
        .list_strategies(&StrategyFilter::stage(LifecycleStage::Active))
        .await
        .unwrap();
    assert_eq!(active.len(), 6);
    let total: Decimal = active
        .iter()
        .filter_map(|r| r.allocation.as_ref().map(|a| a.amount))
        .sum();
    assert_eq!(total, report.allocated);
    assert!(active.iter().all(|r| r.fitness >= 60.0));

    let eliminated = store.get_strategy("MID00").await.unwrap().unwrap();
    assert_eq!(eliminated.stage, LifecycleStage::Eliminated);
    assert!(!eliminated.enabled);

    let children: Vec<_> = live.iter().filter(|r| !r.parent_ids.is_empty()).collect();
    assert!(!children.is_empty());
    assert!(children.iter().all(|c| c.stage == LifecycleStage::Candidate && c.round == 0));

    let stages = engine.stage_counts().await.unwrap();
    assert_eq!(stages.get("active"), Some(&6));
    assert_eq!(stages.get("eliminated"), Some(&14));
    let recent = engine.recent_events(5).await.unwrap();
    assert_eq!(recent.len(), 5);
    assert!(recent.windows(2).all(|w| w[0].sequence > w[1].sequence));

    // Audit trail: ordered by commit sequence
    let history = store.list_evolution_events("ELITE0").await.unwrap();
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(history.first().unwrap().event_type, EvolutionEventType::Survive);
    assert!(history.iter().any(|e| e.event_type == EvolutionEventType::Promote));

    // Signals: every funded momentum strategy sees the rally
    let signals = engine.run_signal_cycle().await.unwrap();
    assert_eq!(signals.emitted, 6);
    let pending = store
        .list_signals(&SignalFilter {
            pending_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 6);
    assert!(pending.iter().all(|s| s.side == TradeSide::Buy));

    // Execution reports a fill for one of them
    let signal = &pending[0];
    let now = Utc::now();
    let trade = TradeRecord {
        id: None,
        strategy_id: signal.strategy_id.clone(),
        symbol: signal.symbol.clone(),
        side: TradeSide::Buy,
        entry_price: signal.price,
        exit_price: signal.price + dec!(5),
        quantity: signal.quantity,
        pnl: dec!(5) * signal.quantity,
        pnl_pct: 3.0,
        opened_at: now,
        closed_at: now,
    };
    engine.record_fill(trade, Some(&signal.id)).await.unwrap();

    let still_pending = store
        .list_signals(&SignalFilter {
            pending_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(still_pending.len(), 5);
    assert_eq!(store.list_trades(&signal.strategy_id).await.unwrap().len(), 1);
}
