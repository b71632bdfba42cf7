//! Sync run ledger

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::store_error;
use crate::error::Result;
use crate::sync::{TimeRange, UnitOutcome};

/// Ledger timestamps use one fixed format so they order as text
pub fn ledger_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One recorded unit execution
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncRun {
    pub id: String,
    pub client_id: String,
    pub entity: String,
    pub window_from: String,
    pub window_to: String,
    pub status: String,
    pub rows_written: i64,
    pub attempts: i64,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl SyncRun {
    pub fn from_outcome(
        client_id: &str,
        window: &TimeRange,
        outcome: &UnitOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            entity: outcome.entity.clone(),
            window_from: window.from.to_rfc3339(),
            window_to: window.to.to_rfc3339(),
            status: outcome.status.as_str().to_string(),
            rows_written: outcome.rows_written as i64,
            attempts: outcome.attempts as i64,
            error_kind: outcome.error.as_ref().map(|e| e.kind.clone()),
            error: outcome.error.as_ref().map(|e| e.message.clone()),
            started_at: ledger_timestamp(started_at),
            finished_at: ledger_timestamp(Utc::now()),
        }
    }
}

/// Run ledger repository
pub struct SyncRunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SyncRunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                id, client_id, entity, window_from, window_to, status,
                rows_written, attempts, error_kind, error, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.client_id)
        .bind(&run.entity)
        .bind(&run.window_from)
        .bind(&run.window_to)
        .bind(&run.status)
        .bind(run.rows_written)
        .bind(run.attempts)
        .bind(&run.error_kind)
        .bind(&run.error)
        .bind(&run.started_at)
        .bind(&run.finished_at)
        .execute(self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    /// Most recent runs first
    pub async fn list(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let runs = sqlx::query_as::<_, SyncRun>(
            r#"
            SELECT id, client_id, entity, window_from, window_to, status,
                   rows_written, attempts, error_kind, error, started_at, finished_at
            FROM sync_runs
            ORDER BY finished_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(store_error)?;

        Ok(runs)
    }

    /// Runs for one client, most recent first
    pub async fn list_for_client(&self, client_id: &str, limit: i64) -> Result<Vec<SyncRun>> {
        let runs = sqlx::query_as::<_, SyncRun>(
            r#"
            SELECT id, client_id, entity, window_from, window_to, status,
                   rows_written, attempts, error_kind, error, started_at, finished_at
            FROM sync_runs
            WHERE client_id = ?
            ORDER BY finished_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(client_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(store_error)?;

        Ok(runs)
    }

    /// Delete runs that finished before `older_than`
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_runs WHERE finished_at < ?")
            .bind(ledger_timestamp(older_than))
            .execute(self.pool)
            .await
            .map_err(store_error)?;

        Ok(result.rows_affected())
    }
}
