//! Sync API endpoints
//!
//! Triggers synchronization of one or all configured clients over a time
//! window and exposes the run ledger.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::{SyncRun, SyncRunRepository};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::sync::{SyncResult, TimeRange};

const DEFAULT_RUNS_LIMIT: i64 = 50;
const MAX_RUNS_LIMIT: i64 = 500;

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(run_sync))
        .route("/runs", get(list_runs))
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// Restrict the run to one client; all configured clients otherwise
    #[serde(default)]
    pub client_id: Option<String>,
    /// Needed when the same client id exists under several providers
    #[serde(default)]
    pub provider: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
    pub client_id: Option<String>,
}

/// Synchronize clients over the requested window
async fn run_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> AppResult<Json<Vec<SyncResult>>> {
    let window =
        TimeRange::new(req.from, req.to).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let clients = match &req.client_id {
        Some(id) => {
            let matching = state.clients_matching(req.provider.as_deref(), id);
            match matching.as_slice() {
                [] => return Err(AppError::NotFound(format!("Unknown client: {}", id))),
                [client] => vec![(*client).clone()],
                _ => {
                    return Err(AppError::BadRequest(format!(
                        "Client {} exists under several providers, pass a provider",
                        id
                    )))
                }
            }
        }
        None => state
            .clients()
            .iter()
            .filter(|c| req.provider.as_deref().map_or(true, |p| c.provider == p))
            .cloned()
            .collect(),
    };

    tracing::info!(
        clients = clients.len(),
        from = %window.from,
        to = %window.to,
        "Sync requested"
    );

    let results = state.orchestrator().sync_many(clients, window).await;
    Ok(Json(results))
}

/// Recent unit runs, newest first
async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> AppResult<Json<Vec<SyncRun>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    let repo = SyncRunRepository::new(state.db());
    let runs = match &query.client_id {
        Some(client_id) => repo.list_for_client(client_id, limit).await?,
        None => repo.list(limit).await?,
    };
    Ok(Json(runs))
}
