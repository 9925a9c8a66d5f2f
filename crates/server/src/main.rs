//! Quant-Evolver, strategy population evolution service
//!
//! Usage:
//!   quant-evolver run --port 3002         : Run the loops and the status API
//!   quant-evolver evolve                  : Run one evolution cycle and print the report
//!   quant-evolver population --all        : Print the current population

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use engine::{
    BinanceClient, Engine, EngineConfig, EngineError, EntryFill, InvalidationReason, LifecycleStage,
    PaperAccount, Scheduler, SignalFilter, SqliteStrategyStore, StrategyRecord, TradeRecord,
    TradeSide, TriggerOutcome,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "quant-evolver")]
#[command(about = "Evolves a population of trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQLite database path (defaults to EVOLVER_DB_PATH or data/evolver.db)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Symbols to trade (comma-separated, overrides EVOLVER_SYMBOLS)
    #[arg(long, global = true, value_delimiter = ',')]
    symbols: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evolution, signal and health loops with the status API
    Run {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3002)]
        port: u16,
    },
    /// Run a single evolution cycle and print its report
    Evolve,
    /// Print the current population
    Population {
        /// Include eliminated strategies
        #[arg(long)]
        all: bool,
    },
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,quant_evolver=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,quant_evolver=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let mut config = EngineConfig::from_env();
    if !cli.symbols.is_empty() {
        config.symbols = cli.symbols.iter().map(|s| s.trim().to_uppercase()).collect();
    }
    let db_path = cli
        .db
        .or_else(|| std::env::var("EVOLVER_DB_PATH").ok())
        .unwrap_or_else(|| "data/evolver.db".to_string());

    let engine = Arc::new(build_engine(config, &db_path).await?);

    match cli.command {
        Commands::Run { host, port } => {
            cmd_run(engine, &host, port, &db_path).await?;
        }
        Commands::Evolve => {
            cmd_evolve(engine).await?;
        }
        Commands::Population { all } => {
            cmd_population(engine, all).await?;
        }
    }

    Ok(())
}

async fn build_engine(config: EngineConfig, db_path: &str) -> anyhow::Result<Engine> {
    let db = persistence::Database::new(db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let store = Arc::new(SqliteStrategyStore::new(db.pool_clone()));
    let market = Arc::new(BinanceClient::new(config.fetch_timeout())?);
    let account = Arc::new(PaperAccount::new(config.paper_capital));

    Ok(Engine::with_paper_account(config, store, market, account))
}

// ============================================================================
// Run command: loops + status API
// ============================================================================

async fn cmd_run(engine: Arc<Engine>, host: &str, port: u16, db_path: &str) -> anyhow::Result<()> {
    info!("Quant-Evolver v{} starting...", APP_VERSION);

    let scheduler = Arc::new(Scheduler::new(engine.clone()));
    let handles = scheduler.start();

    let state = AppState {
        engine,
        scheduler: scheduler.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/strategies", get(api_strategies))
        .route("/strategies/:id/events", get(api_strategy_events))
        .route("/events", get(api_recent_events))
        .route("/signals", get(api_signals))
        .route("/entries", post(api_record_entry))
        .route("/fills", post(api_record_fill))
        .route("/cache/refresh", post(api_refresh_cache))
        .route("/paper/transfer", post(api_paper_transfer))
        .route("/evolve", post(api_evolve))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Quant-Evolver v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                 - Loop and cache health");
    println!("  GET  /api/strategies             - Population snapshot");
    println!("  GET  /api/strategies/:id/events  - Evolution history of a strategy");
    println!("  GET  /api/events                 - Latest evolution decisions");
    println!("  GET  /api/signals                - Emitted signals");
    println!("  POST /api/entries                - Report an opening fill");
    println!("  POST /api/fills                  - Report a closed trade");
    println!("  POST /api/cache/refresh          - Invalidate cached account state");
    println!("  POST /api/paper/transfer         - Deposit to or withdraw from the paper account");
    println!("  POST /api/evolve                 - Trigger an evolution cycle");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl+C received, shutting down");
        })
        .await?;

    scheduler.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Loop task ended abnormally");
        }
    }

    Ok(())
}

// ============================================================================
// One-shot commands
// ============================================================================

async fn cmd_evolve(engine: Arc<Engine>) -> anyhow::Result<()> {
    println!("\n=== Quant-Evolver v{} ===", APP_VERSION);
    let report = engine.run_evolution_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_population(engine: Arc<Engine>, all: bool) -> anyhow::Result<()> {
    let population = engine.population_snapshot(all).await?;
    print_population(&population);
    Ok(())
}

fn print_population(population: &[StrategyRecord]) {
    println!("\n{}", "=".repeat(100));
    println!("  POPULATION ({} strategies)", population.len());
    println!("{}", "=".repeat(100));
    println!(
        "  {:<32} {:<16} {:<9} {:>4} {:>5} {:<10} {:>7} {:>7} {:>12}",
        "ID", "Archetype", "Symbol", "Gen", "Round", "Stage", "Fitness", "Trades", "Allocation"
    );
    println!("  {}", "-".repeat(98));

    for r in population {
        let allocation = r
            .allocation
            .as_ref()
            .map(|a| format!("${:.2}", a.amount))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<32} {:<16} {:<9} {:>4} {:>5} {:<10} {:>7.1} {:>7} {:>12}",
            r.id,
            r.archetype.as_str(),
            r.symbol,
            r.generation,
            r.round,
            r.stage.as_str(),
            r.fitness,
            r.stats.trade_count,
            allocation
        );
    }
    println!("{}", "=".repeat(100));
}

// ============================================================================
// API Handlers
// ============================================================================

fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.scheduler.health().await;
    let stages = match state.engine.stage_counts().await {
        Ok(counts) => Some(counts),
        Err(e) => {
            warn!("Stage counts unavailable: {}", e);
            None
        }
    };
    Json(serde_json::json!({
        "status": if health.healthy && stages.is_some() { "ok" } else { "degraded" },
        "service": "quant-evolver",
        "version": APP_VERSION,
        "loops": health.loops,
        "cache": health.cache,
        "cycles_run": health.cycles_run,
        "stages": stages,
    }))
}

#[derive(Debug, Deserialize)]
struct StrategiesQuery {
    #[serde(default)]
    all: bool,
    stage: Option<String>,
}

/// GET /api/strategies: population snapshot, best first
async fn api_strategies(
    State(state): State<AppState>,
    Query(query): Query<StrategiesQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let stage = match query.stage.as_deref() {
        Some(raw) => Some(LifecycleStage::parse(raw).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let mut population = state
        .engine
        .population_snapshot(query.all || stage == Some(LifecycleStage::Eliminated))
        .await
        .map_err(|e| {
            error!("Failed to list strategies: {}", e);
            error_status(&e)
        })?;
    if let Some(stage) = stage {
        population.retain(|r| r.stage == stage);
    }

    Ok(Json(serde_json::json!({
        "count": population.len(),
        "strategies": population,
    })))
}

/// GET /api/strategies/:id/events
async fn api_strategy_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let events = state.engine.evolution_history(&id).await.map_err(|e| {
        error!("Failed to load events for {}: {}", id, e);
        error_status(&e)
    })?;
    Ok(Json(serde_json::json!({
        "strategy_id": id,
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

/// GET /api/events: latest evolution decisions, newest first
async fn api_recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit = query.limit.unwrap_or(50).min(500);
    let events = state.engine.recent_events(limit).await.map_err(|e| {
        error!("Failed to load recent events: {}", e);
        error_status(&e)
    })?;
    Ok(Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
struct SignalsQuery {
    strategy_id: Option<String>,
    #[serde(default)]
    pending: bool,
    limit: Option<usize>,
}

/// GET /api/signals: newest first
async fn api_signals(
    State(state): State<AppState>,
    Query(query): Query<SignalsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let filter = SignalFilter {
        strategy_id: query.strategy_id,
        pending_only: query.pending,
        limit: query.limit.unwrap_or(100).min(1000),
    };
    let signals = state
        .engine
        .store()
        .list_signals(&filter)
        .await
        .map_err(|e| {
            error!("Failed to list signals: {}", e);
            error_status(&e)
        })?;
    Ok(Json(serde_json::json!({
        "count": signals.len(),
        "signals": signals,
    })))
}

#[derive(Debug, Deserialize)]
struct FillRequest {
    strategy_id: String,
    symbol: String,
    side: TradeSide,
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
    /// Derived from prices and quantity when absent
    pnl: Option<Decimal>,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    signal_id: Option<String>,
}

impl FillRequest {
    fn into_trade(self) -> (TradeRecord, Option<String>) {
        let direction = match self.side {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => -Decimal::ONE,
        };
        let pnl = self
            .pnl
            .unwrap_or((self.exit_price - self.entry_price) * self.quantity * direction);
        let pnl_pct = if self.entry_price > Decimal::ZERO {
            ((self.exit_price - self.entry_price) / self.entry_price * direction * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        let trade = TradeRecord {
            id: None,
            strategy_id: self.strategy_id,
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            exit_price: self.exit_price,
            quantity: self.quantity,
            pnl,
            pnl_pct,
            opened_at: self.opened_at,
            closed_at: self.closed_at.unwrap_or_else(Utc::now),
        };
        (trade, self.signal_id)
    }
}

/// POST /api/entries: an opening fill reported by the execution side
async fn api_record_entry(
    State(state): State<AppState>,
    Json(entry): Json<EntryFill>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if entry.quantity <= Decimal::ZERO || entry.price <= Decimal::ZERO {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.engine.record_entry(&entry).await.map_err(|e| {
        warn!("Entry rejected for {}: {}", entry.strategy_id, e);
        error_status(&e)
    })?;

    Ok(Json(serde_json::json!({
        "status": "recorded",
        "strategy_id": entry.strategy_id,
        "signal_id": entry.signal_id,
    })))
}

/// POST /api/fills: a closed trade reported by the execution side
async fn api_record_fill(
    State(state): State<AppState>,
    Json(request): Json<FillRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if request.quantity <= Decimal::ZERO || request.entry_price <= Decimal::ZERO {
        return Err(StatusCode::BAD_REQUEST);
    }
    let (trade, signal_id) = request.into_trade();
    let strategy_id = trade.strategy_id.clone();
    let trade_id = state
        .engine
        .record_fill(trade, signal_id.as_deref())
        .await
        .map_err(|e| {
            warn!("Fill rejected for {}: {}", strategy_id, e);
            error_status(&e)
        })?;

    Ok(Json(serde_json::json!({
        "status": "recorded",
        "trade_id": trade_id,
        "strategy_id": strategy_id,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    reason: Option<InvalidationReason>,
}

/// POST /api/cache/refresh: invalidate and refetch account state
async fn api_refresh_cache(
    State(state): State<AppState>,
    request: Option<Json<RefreshRequest>>,
) -> Json<serde_json::Value> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or(InvalidationReason::ManualRefresh);
    state.engine.invalidate_account(reason);
    let cache = state.engine.refresh_account_cache().await;
    Json(serde_json::json!({
        "status": "refreshed",
        "reason": reason,
        "cache": cache,
    }))
}

#[derive(Debug, Deserialize)]
struct TransferRequest {
    /// Positive deposits, negative withdraws
    amount: Decimal,
}

/// POST /api/paper/transfer: move cash in or out of the paper account
async fn api_paper_transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if request.amount.is_zero() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !state.engine.transfer_paper_funds(request.amount).await {
        return Err(StatusCode::CONFLICT);
    }
    let cache = state.engine.refresh_account_cache().await;
    Ok(Json(serde_json::json!({
        "status": "transferred",
        "amount": request.amount,
        "cache": cache,
    })))
}

/// POST /api/evolve: manual single-flight evolution trigger
async fn api_evolve(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.scheduler.trigger_evolution().await {
        TriggerOutcome::Completed(report) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "completed", "report": report })),
        ),
        TriggerOutcome::Skipped(reason) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "skipped", "skip": reason })),
        ),
        TriggerOutcome::Failed(e) => {
            error!("Manual evolution failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "failed", "error": e })),
            )
        }
    }
}
