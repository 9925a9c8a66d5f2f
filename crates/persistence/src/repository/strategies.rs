//! Strategy repository: the persisted population

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A strategy row as stored in the `strategies` table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StrategyRow {
    pub id: String,
    pub archetype: String,
    pub symbol: String,
    /// JSON object name -> number
    pub parameters: String,
    pub generation: i64,
    pub round: i64,
    pub stage: String,
    pub enabled: bool,
    pub fitness: f64,
    /// JSON stats snapshot
    pub stats: String,
    /// JSON array of parent ids
    pub parent_ids: String,
    /// JSON capital allocation, NULL when unfunded
    pub allocation: Option<String>,
    pub last_evolved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Filter for listing strategies
#[derive(Debug, Clone, Default)]
pub struct StrategyQuery {
    /// Only rows in one of these stages (empty = any stage)
    pub stages: Vec<String>,
    pub symbol: Option<String>,
    pub include_disabled: bool,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, archetype, symbol, parameters, generation, round, stage, enabled,
           fitness, stats, parent_ids, allocation, last_evolved_at, created_at, updated_at
    FROM strategies
"#;

/// Repository for the strategy population
pub struct StrategyRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StrategyRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a strategy (upsert by id)
    pub async fn upsert(&self, row: &StrategyRow) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO strategies
                (id, archetype, symbol, parameters, generation, round, stage, enabled,
                 fitness, stats, parent_ids, allocation, last_evolved_at, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
               ON CONFLICT(id) DO UPDATE SET
                 archetype = excluded.archetype,
                 symbol = excluded.symbol,
                 parameters = excluded.parameters,
                 generation = excluded.generation,
                 round = excluded.round,
                 stage = excluded.stage,
                 enabled = excluded.enabled,
                 fitness = excluded.fitness,
                 stats = excluded.stats,
                 parent_ids = excluded.parent_ids,
                 allocation = excluded.allocation,
                 last_evolved_at = excluded.last_evolved_at,
                 updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.id)
        .bind(&row.archetype)
        .bind(&row.symbol)
        .bind(&row.parameters)
        .bind(row.generation)
        .bind(row.round)
        .bind(&row.stage)
        .bind(row.enabled)
        .bind(row.fitness)
        .bind(&row.stats)
        .bind(&row.parent_ids)
        .bind(&row.allocation)
        .bind(row.last_evolved_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Get a strategy by id
    pub async fn get(&self, id: &str) -> DbResult<Option<StrategyRow>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let row = sqlx::query_as::<_, StrategyRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(row)
    }

    /// List strategies matching the query, best fitness first
    pub async fn list(&self, query: &StrategyQuery) -> DbResult<Vec<StrategyRow>> {
        let mut where_clauses = vec!["1=1".to_string()];
        let mut binds: Vec<String> = Vec::new();

        if !query.stages.is_empty() {
            let placeholders = vec!["?"; query.stages.len()].join(", ");
            where_clauses.push(format!("stage IN ({placeholders})"));
            binds.extend(query.stages.iter().cloned());
        }
        if let Some(sym) = &query.symbol {
            where_clauses.push("symbol = ?".to_string());
            binds.push(sym.clone());
        }
        if !query.include_disabled {
            where_clauses.push("enabled = 1".to_string());
        }

        let sql = format!(
            "{SELECT_COLUMNS} WHERE {} ORDER BY fitness DESC, created_at ASC",
            where_clauses.join(" AND ")
        );

        let mut q = sqlx::query_as::<_, StrategyRow>(&sql);
        for b in &binds {
            q = q.bind(b);
        }

        let rows = q.fetch_all(self.pool).await?;
        Ok(rows)
    }

    /// Count strategies per stage (enabled and disabled)
    pub async fn count_by_stage(&self) -> DbResult<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT stage, COUNT(*) FROM strategies GROUP BY stage ORDER BY stage")
                .fetch_all(self.pool)
                .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn row(id: &str, stage: &str, fitness: f64) -> StrategyRow {
        StrategyRow {
            id: id.to_string(),
            archetype: "momentum".to_string(),
            symbol: "BTCUSDT".to_string(),
            parameters: r#"{"lookback":14.0}"#.to_string(),
            generation: 0,
            round: 0,
            stage: stage.to_string(),
            enabled: stage != "eliminated",
            fitness,
            stats: "{}".to_string(),
            parent_ids: "[]".to_string(),
            allocation: None,
            last_evolved_at: None,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_existing_row() {
        let db = Database::in_memory().await.unwrap();
        let repo = StrategyRepository::new(db.pool());

        let mut r = row("S1", "candidate", 0.0);
        repo.upsert(&r).await.unwrap();

        r.stage = "qualified".to_string();
        r.fitness = 72.5;
        r.round = 3;
        repo.upsert(&r).await.unwrap();

        let loaded = repo.get("S1").await.unwrap().unwrap();
        assert_eq!(loaded.stage, "qualified");
        assert_eq!(loaded.round, 3);
        assert!((loaded.fitness - 72.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_list_filters_stage_and_disabled() {
        let db = Database::in_memory().await.unwrap();
        let repo = StrategyRepository::new(db.pool());

        repo.upsert(&row("A", "active", 85.0)).await.unwrap();
        repo.upsert(&row("B", "qualified", 65.0)).await.unwrap();
        repo.upsert(&row("C", "eliminated", 20.0)).await.unwrap();

        let live = repo.list(&StrategyQuery::default()).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].id, "A");

        let active = repo
            .list(&StrategyQuery {
                stages: vec!["active".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);

        let all = repo
            .list(&StrategyQuery {
                include_disabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let counts = repo.count_by_stage().await.unwrap();
        assert_eq!(counts.len(), 3);
    }
}
