//! Database schema initialization

use sqlx::SqlitePool;

use super::store_error;
use crate::error::{Result, SyncError};
use crate::sync::{ColumnKind, EntitySchema};

/// Initialize the engine's own tables
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(store_error)?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- One row per (client, entity) unit execution
CREATE TABLE IF NOT EXISTS sync_runs (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    entity TEXT NOT NULL,
    window_from TEXT NOT NULL,
    window_to TEXT NOT NULL,
    status TEXT NOT NULL,
    rows_written INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 1,
    error_kind TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_client ON sync_runs(client_id, entity);
CREATE INDEX IF NOT EXISTS idx_sync_runs_finished ON sync_runs(finished_at);
"#;

/// Whether a name can be used as a table or column identifier
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn check_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(SyncError::Config(format!("invalid identifier '{}'", name)))
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name)
}

/// `CREATE TABLE` statement for an entity, with its business key as the
/// conflict constraint
pub fn table_ddl(schema: &EntitySchema) -> Result<String> {
    schema.validate()?;

    let mut definitions: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let sql_type = match column.kind {
                ColumnKind::Text | ColumnKind::Json => "TEXT",
                ColumnKind::Integer => "INTEGER",
                ColumnKind::Real => "REAL",
            };
            let not_null = !column.nullable || schema.key.contains(&column.name);
            format!(
                "{} {}{}",
                quote_identifier(&column.name),
                sql_type,
                if not_null { " NOT NULL" } else { "" }
            )
        })
        .collect();

    let key: Vec<String> = schema.key.fields().iter().map(|f| quote_identifier(f)).collect();
    definitions.push(format!("UNIQUE({})", key.join(", ")));

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_identifier(&schema.table),
        definitions.join(",\n    ")
    ))
}

/// Create an entity table if it does not exist yet
pub async fn ensure_table(pool: &SqlitePool, schema: &EntitySchema) -> Result<()> {
    let ddl = table_ddl(schema)?;
    sqlx::query(&ddl).execute(pool).await.map_err(store_error)?;
    tracing::debug!(table = %schema.table, "Ensured entity table");
    Ok(())
}
