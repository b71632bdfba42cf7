//! Database module for SQLite persistence
//!
//! Entity tables, the idempotent upsert gateway, and the sync run ledger.

mod runs;
mod schema;
mod upsert;

pub use runs::*;
pub use schema::*;
pub use upsert::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::{AppResult, SyncError};

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

// SQLite primary result codes
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Whether a store error may heal without intervention
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}

/// Classify a store error into the engine taxonomy
pub(crate) fn store_error(err: sqlx::Error) -> SyncError {
    if is_transient(&err) {
        SyncError::PersistenceTransient(err.to_string())
    } else {
        SyncError::PersistenceFatal(err.to_string())
    }
}
