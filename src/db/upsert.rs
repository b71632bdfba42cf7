//! Idempotent upsert gateway

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::SqlitePool;
use std::collections::HashSet;

use super::{check_identifier, quote_identifier, store_error};
use crate::error::{Result, SyncError};
use crate::reconcile::{KeyFields, ReconciledRow};
use crate::transport::RetryPolicy;

static NULL: Value = Value::Null;

/// Reconciled rows bound for one table, written in one transaction
#[derive(Debug, Clone)]
pub struct UpsertBatch {
    pub table: String,
    pub rows: Vec<ReconciledRow>,
}

impl UpsertBatch {
    pub fn new(table: impl Into<String>, rows: Vec<ReconciledRow>) -> Self {
        Self {
            table: table.into(),
            rows,
        }
    }

    /// Column names in first-seen order across all rows
    fn columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for row in &self.rows {
            for name in row.fields.keys() {
                if seen.insert(name.as_str()) {
                    columns.push(name.clone());
                }
            }
        }
        columns
    }
}

/// Writes batches with insert-or-update semantics.
///
/// A batch is all or nothing. Transient store failures retry the whole
/// batch under the gateway's own policy; anything else fails it at once.
#[derive(Clone)]
pub struct UpsertGateway {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl UpsertGateway {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert each row; on a `conflict_key` clash update exactly
    /// `update_fields` and leave every other column untouched.
    ///
    /// Returns the number of rows inserted or updated.
    #[tracing::instrument(level = "debug", skip_all, fields(table = %batch.table, rows = batch.rows.len()))]
    pub async fn upsert(
        &self,
        batch: UpsertBatch,
        conflict_key: &KeyFields,
        update_fields: &[String],
    ) -> Result<u64> {
        if batch.rows.is_empty() {
            return Ok(0);
        }

        let mut keys = HashSet::new();
        for row in &batch.rows {
            if !keys.insert(&row.key) {
                return Err(SyncError::PersistenceFatal(format!(
                    "batch for {} holds key {} more than once",
                    batch.table, row.key
                )));
            }
        }

        let columns = batch.columns();
        let sql = upsert_sql(&batch.table, &columns, conflict_key, update_fields)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.write(&batch, &sql, &columns).await {
                Ok(written) => {
                    tracing::debug!(table = %batch.table, written, attempt, "Upserted batch");
                    return Ok(written);
                }
                Err(err) => {
                    let err = store_error(err);
                    let transient = matches!(err, SyncError::PersistenceTransient(_));
                    if !transient || attempt >= self.policy.max_attempts {
                        tracing::error!(
                            table = %batch.table,
                            rows = batch.rows.len(),
                            attempt,
                            error = %err,
                            "Batch rolled back"
                        );
                        return Err(err);
                    }

                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        table = %batch.table,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient store error, retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn write(
        &self,
        batch: &UpsertBatch,
        sql: &str,
        columns: &[String],
    ) -> std::result::Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for row in &batch.rows {
            let mut query = sqlx::query(sql);
            for column in columns {
                query = bind_value(query, row.fields.get(column).unwrap_or(&NULL));
            }
            match query.execute(&mut *tx).await {
                Ok(result) => written += result.rows_affected(),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!(error = %rollback, "Rollback failed");
                    }
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        Ok(written)
    }
}

fn upsert_sql(
    table: &str,
    columns: &[String],
    conflict_key: &KeyFields,
    update_fields: &[String],
) -> Result<String> {
    check_identifier(table)?;
    for name in columns.iter().chain(conflict_key.fields()).chain(update_fields) {
        check_identifier(name)?;
    }
    for field in conflict_key.fields() {
        if !columns.contains(field) {
            return Err(SyncError::PersistenceFatal(format!(
                "batch for {} has no value for key field {}",
                table, field
            )));
        }
    }

    let column_list: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let key_list: Vec<String> = conflict_key
        .fields()
        .iter()
        .map(|c| quote_identifier(c))
        .collect();

    // Fields absent from the batch are left as they are
    let assignments: Vec<String> = update_fields
        .iter()
        .filter(|f| columns.contains(*f) && !conflict_key.contains(f))
        .map(|f| format!("{0} = excluded.{0}", quote_identifier(f)))
        .collect();

    let action = if assignments.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_identifier(table),
        column_list.join(", "),
        placeholders,
        key_list.join(", "),
        action
    ))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}
