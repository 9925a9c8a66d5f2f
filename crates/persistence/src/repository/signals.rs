//! Signal repository: signals emitted by active strategies

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted signal
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SignalRow {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub price: String,
    pub quantity: String,
    pub confidence: f64,
    pub executed: bool,
    pub created_at: i64,
}

/// Repository for emitted signals
pub struct SignalRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SignalRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a signal (ids are unique, duplicates are ignored)
    pub async fn insert(&self, signal: &SignalRow) -> DbResult<bool> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO signals
                (id, strategy_id, symbol, side, price, quantity, confidence, executed, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.strategy_id)
        .bind(&signal.symbol)
        .bind(&signal.side)
        .bind(&signal.price)
        .bind(&signal.quantity)
        .bind(signal.confidence)
        .bind(signal.executed)
        .bind(signal.created_at)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List signals, newest first, optionally for one strategy / only pending ones
    pub async fn list(
        &self,
        strategy_id: Option<&str>,
        pending_only: bool,
        limit: i64,
    ) -> DbResult<Vec<SignalRow>> {
        let mut sql = String::from(
            r#"SELECT id, strategy_id, symbol, side, price, quantity, confidence, executed, created_at
               FROM signals
               WHERE 1=1"#,
        );
        if strategy_id.is_some() {
            sql.push_str(" AND strategy_id = ?");
        }
        if pending_only {
            sql.push_str(" AND executed = 0");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, SignalRow>(&sql);
        if let Some(id) = strategy_id {
            q = q.bind(id);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(self.pool).await?;
        Ok(rows)
    }

    /// Mark a signal as consumed by the execution side
    pub async fn mark_executed(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("UPDATE signals SET executed = 1 WHERE id = ?1 AND executed = 0")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn signal(id: &str, created_at: i64) -> SignalRow {
        SignalRow {
            id: id.to_string(),
            strategy_id: "S1".to_string(),
            symbol: "ETHUSDT".to_string(),
            side: "buy".to_string(),
            price: "2500.50".to_string(),
            quantity: "0.1".to_string(),
            confidence: 0.7,
            executed: false,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_signal_consumed_exactly_once() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        assert!(repo.insert(&signal("SIG1", 1)).await.unwrap());
        assert!(!repo.insert(&signal("SIG1", 1)).await.unwrap());
        repo.insert(&signal("SIG2", 2)).await.unwrap();

        assert!(repo.mark_executed("SIG1").await.unwrap());
        assert!(!repo.mark_executed("SIG1").await.unwrap());

        let pending = repo.list(None, true, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "SIG2");

        let all = repo.list(Some("S1"), false, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "SIG2");
    }
}
