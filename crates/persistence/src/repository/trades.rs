//! Trade repository: fills reported by the execution side

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A closed trade attributed to a strategy
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRow {
    pub id: Option<i64>,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub exit_price: String,
    pub quantity: String,
    pub pnl: String,
    pub pnl_pct: f64,
    pub opened_at: i64,
    pub closed_at: i64,
}

/// Repository for strategy trade history (append-only)
pub struct TradeRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TradeRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, trade: &TradeRow) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO strategy_trades
                (strategy_id, symbol, side, entry_price, exit_price, quantity,
                 pnl, pnl_pct, opened_at, closed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&trade.strategy_id)
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(&trade.entry_price)
        .bind(&trade.exit_price)
        .bind(&trade.quantity)
        .bind(&trade.pnl)
        .bind(trade.pnl_pct)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Trades of one strategy, oldest first
    pub async fn list_for_strategy(&self, strategy_id: &str) -> DbResult<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"SELECT id, strategy_id, symbol, side, entry_price, exit_price, quantity,
                      pnl, pnl_pct, opened_at, closed_at
               FROM strategy_trades
               WHERE strategy_id = ?1
               ORDER BY closed_at ASC, id ASC"#,
        )
        .bind(strategy_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_trades_listed_in_close_order() {
        let db = Database::in_memory().await.unwrap();
        let repo = TradeRepository::new(db.pool());

        for (i, closed_at) in [30i64, 10, 20].iter().enumerate() {
            repo.append(&TradeRow {
                id: None,
                strategy_id: "S1".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: "buy".to_string(),
                entry_price: "100".to_string(),
                exit_price: "101".to_string(),
                quantity: "1".to_string(),
                pnl: format!("{}", i + 1),
                pnl_pct: 1.0,
                opened_at: 0,
                closed_at: *closed_at,
            })
            .await
            .unwrap();
        }

        let trades = repo.list_for_strategy("S1").await.unwrap();
        let closes: Vec<i64> = trades.iter().map(|t| t.closed_at).collect();
        assert_eq!(closes, vec![10, 20, 30]);
        assert!(repo.list_for_strategy("S2").await.unwrap().is_empty());
    }
}
