//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::sync::{ClientContext, SyncOrchestrator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: SqlitePool,
    orchestrator: SyncOrchestrator,
    clients: Vec<ClientContext>,
}

impl AppState {
    pub fn new(db: SqlitePool, orchestrator: SyncOrchestrator, clients: Vec<ClientContext>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                orchestrator,
                clients,
            }),
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.inner.orchestrator
    }

    /// Configured client accounts
    pub fn clients(&self) -> &[ClientContext] {
        &self.inner.clients
    }

    /// Clients with this id, narrowed to one provider when given
    pub fn clients_matching(&self, provider: Option<&str>, client_id: &str) -> Vec<&ClientContext> {
        self.inner
            .clients
            .iter()
            .filter(|c| c.client_id == client_id)
            .filter(|c| provider.map_or(true, |p| c.provider == p))
            .collect()
    }
}
