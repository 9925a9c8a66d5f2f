//! Evolution event repository: append-only audit log

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A single evolution event row. `sequence` is assigned on insert.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EvolutionEventRow {
    pub sequence: Option<i64>,
    pub strategy_id: String,
    pub event_type: String,
    pub old_parameters: Option<String>,
    pub new_parameters: Option<String>,
    pub old_fitness: Option<f64>,
    pub new_fitness: Option<f64>,
    pub reason: String,
    pub created_at: i64,
}

/// Repository for the evolution audit log. Rows are never updated or deleted.
pub struct EvolutionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EvolutionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event, returning its commit sequence
    pub async fn append(&self, event: &EvolutionEventRow) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO evolution_events
                (strategy_id, event_type, old_parameters, new_parameters,
                 old_fitness, new_fitness, reason, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&event.strategy_id)
        .bind(&event.event_type)
        .bind(&event.old_parameters)
        .bind(&event.new_parameters)
        .bind(event.old_fitness)
        .bind(event.new_fitness)
        .bind(&event.reason)
        .bind(event.created_at)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Events for one strategy in commit order
    pub async fn list_for_strategy(&self, strategy_id: &str) -> DbResult<Vec<EvolutionEventRow>> {
        let rows = sqlx::query_as::<_, EvolutionEventRow>(
            r#"SELECT sequence, strategy_id, event_type, old_parameters, new_parameters,
                      old_fitness, new_fitness, reason, created_at
               FROM evolution_events
               WHERE strategy_id = ?1
               ORDER BY sequence ASC"#,
        )
        .bind(strategy_id)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }

    /// Most recent events across the population, newest first
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<EvolutionEventRow>> {
        let rows = sqlx::query_as::<_, EvolutionEventRow>(
            r#"SELECT sequence, strategy_id, event_type, old_parameters, new_parameters,
                      old_fitness, new_fitness, reason, created_at
               FROM evolution_events
               ORDER BY sequence DESC
               LIMIT ?1"#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn event(strategy_id: &str, event_type: &str) -> EvolutionEventRow {
        EvolutionEventRow {
            sequence: None,
            strategy_id: strategy_id.to_string(),
            event_type: event_type.to_string(),
            old_parameters: None,
            new_parameters: Some(r#"{"period":14.0}"#.to_string()),
            old_fitness: None,
            new_fitness: Some(0.0),
            reason: "test".to_string(),
            created_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_sequences_are_strictly_increasing() {
        let db = Database::in_memory().await.unwrap();
        let repo = EvolutionRepository::new(db.pool());

        let s1 = repo.append(&event("S1", "spawn")).await.unwrap();
        let s2 = repo.append(&event("S2", "spawn")).await.unwrap();
        let s3 = repo.append(&event("S1", "eliminate")).await.unwrap();
        assert!(s1 < s2 && s2 < s3);

        let history = repo.list_for_strategy("S1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "spawn");
        assert_eq!(history[1].event_type, "eliminate");

        let recent = repo.recent(1).await.unwrap();
        assert_eq!(recent[0].sequence, Some(s3));
    }
}
