//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision.
/// Parameter maps, stats snapshots and allocations are stored as JSON TEXT.
pub const CREATE_TABLES: &str = r#"
-- Strategy population (eliminated rows are kept for audit)
CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY,
    archetype TEXT NOT NULL,
    symbol TEXT NOT NULL,
    parameters TEXT NOT NULL,
    generation INTEGER NOT NULL DEFAULT 0,
    round INTEGER NOT NULL DEFAULT 0,
    stage TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    fitness REAL NOT NULL DEFAULT 0,
    stats TEXT NOT NULL,
    parent_ids TEXT NOT NULL DEFAULT '[]',
    allocation TEXT,
    last_evolved_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Append-only evolution audit log
CREATE TABLE IF NOT EXISTS evolution_events (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    old_parameters TEXT,
    new_parameters TEXT,
    old_fitness REAL,
    new_fitness REAL,
    reason TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Signals produced by active strategies
CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    confidence REAL NOT NULL,
    executed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Fills reported back by the execution side
CREATE TABLE IF NOT EXISTS strategy_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    exit_price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    pnl TEXT NOT NULL,
    pnl_pct REAL NOT NULL,
    opened_at INTEGER NOT NULL,
    closed_at INTEGER NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_strategies_stage ON strategies(stage, enabled);
CREATE INDEX IF NOT EXISTS idx_strategies_symbol ON strategies(symbol);
CREATE INDEX IF NOT EXISTS idx_events_strategy ON evolution_events(strategy_id, sequence);
CREATE INDEX IF NOT EXISTS idx_signals_strategy ON signals(strategy_id, created_at);
CREATE INDEX IF NOT EXISTS idx_signals_executed ON signals(executed);
CREATE INDEX IF NOT EXISTS idx_trades_strategy ON strategy_trades(strategy_id, closed_at)
"#;
