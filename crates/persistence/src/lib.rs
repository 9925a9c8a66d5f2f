//! Persistence layer for the strategy evolution engine
//!
//! Provides SQLite storage for the strategy population, the append-only
//! evolution audit log, emitted signals and reported fills.

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Connection-level settings applied after the schema is in place.
/// WAL lets the signal loop read while the evolution loop writes.
const PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
    "PRAGMA busy_timeout=5000",
    "PRAGMA cache_size=-8000",
];

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Connection(format!("{}: {e}", parent.display())))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let db = Self::connect(&url, 5).await?;
        info!(path = %path.display(), "Database ready");
        Ok(db)
    }

    /// Single-connection in-memory database, used by tests
    pub async fn in_memory() -> DbResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.create_schema().await?;
        db.apply_pragmas().await?;
        Ok(db)
    }

    /// Run every statement of the schema script, skipping comment-only chunks
    async fn create_schema(&self) -> DbResult<()> {
        let statements = schema::CREATE_TABLES.split(';').filter_map(|chunk| {
            let sql = chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim().to_string();
            (!sql.is_empty()).then_some(sql)
        });

        let mut applied = 0usize;
        for sql in statements {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
            applied += 1;
        }
        debug!(statements = applied, "Schema applied");
        Ok(())
    }

    async fn apply_pragmas(&self) -> DbResult<()> {
        for pragma in PRAGMAS {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("{pragma} failed: {e}")))?;
        }
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clone the pool for use in spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_creates_all_tables() {
        let db = Database::in_memory().await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(
            names,
            vec!["evolution_events", "signals", "strategies", "strategy_trades"]
        );
    }

    #[tokio::test]
    async fn test_file_database_reopens_existing_schema() {
        let dir = std::env::temp_dir().join(format!("evolver-db-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("nested").join("evolver.db");

        let first = Database::new(&path).await.unwrap();
        sqlx::query("INSERT INTO evolution_events (strategy_id, event_type, reason, created_at) VALUES ('S1', 'spawn', 'seed', 1)")
            .execute(first.pool())
            .await
            .unwrap();
        first.pool().close().await;

        let second = Database::new(&path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM evolution_events")
            .fetch_one(second.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        second.pool().close().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
