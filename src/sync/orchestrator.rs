//! Sync orchestrator
//!
//! Runs every entity of a client's provider as an independent unit:
//! fetch, normalize, reconcile, project, persist in batches, hand the rows
//! to sinks, and record the outcome. A unit failure is reported in the
//! client's [`SyncResult`] and never stops its siblings.

use chrono::Utc;
use futures::future::{self, FutureExt};
use futures::stream::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{
    ClientContext, EntitySource, EntitySync, RowSink, SyncResult, TimeRange, UnitError,
    UnitOutcome, UnitStatus,
};
use crate::db::{ensure_table, initialize_schema, SyncRun, SyncRunRepository, UpsertBatch, UpsertGateway};
use crate::error::{Result, SyncError};
use crate::jobs::JobRunner;
use crate::pagination::fetch;
use crate::reconcile::{reconcile, RawRecord, ReconciledRow};
use crate::transport::{Provider, Transport};

/// Concurrency and retry settings for units
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Upper bound on units running at once across all clients
    pub max_concurrent_units: usize,
    /// Extra attempts for a unit that failed on infrastructure
    pub unit_retries: u32,
    pub unit_retry_delay: Duration,
    pub batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_units: 4,
            unit_retries: 2,
            unit_retry_delay: Duration::from_secs(5),
            batch_size: 500,
        }
    }
}

/// What one unit execution produced
struct UnitRun {
    result: Result<()>,
    /// Rows committed by the last attempt, even when it failed later on
    rows_written: u64,
    attempts: u32,
}

/// Progress of one persistence attempt
struct Persisted {
    result: Result<()>,
    written: u64,
    /// Leading rows whose batches were committed
    committed_rows: usize,
}

pub struct SyncOrchestrator {
    providers: HashMap<String, Arc<Provider>>,
    entities: Vec<Arc<dyn EntitySync>>,
    gateway: UpsertGateway,
    sinks: Vec<Arc<dyn RowSink>>,
    settings: SyncSettings,
    units: Semaphore,
}

impl SyncOrchestrator {
    pub fn new(gateway: UpsertGateway, settings: SyncSettings) -> Self {
        let permits = settings.max_concurrent_units.max(1);
        Self {
            providers: HashMap::new(),
            entities: Vec::new(),
            gateway,
            sinks: Vec::new(),
            settings,
            units: Semaphore::new(permits),
        }
    }

    pub fn with_provider(mut self, provider: Arc<Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn with_entity(mut self, entity: Arc<dyn EntitySync>) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RowSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Create the run ledger and every entity table
    pub async fn prepare(&self) -> Result<()> {
        initialize_schema(self.gateway.pool()).await?;
        for entity in &self.entities {
            if !self.providers.contains_key(entity.provider()) {
                return Err(SyncError::Config(format!(
                    "entity {} references unknown provider {}",
                    entity.name(),
                    entity.provider()
                )));
            }
            ensure_table(self.gateway.pool(), entity.schema()).await?;
        }
        Ok(())
    }

    /// Synchronize every entity of the client's provider over `window`
    #[tracing::instrument(skip(self, client), fields(client = %client.client_id, provider = %client.provider))]
    pub async fn sync(&self, client: ClientContext, window: TimeRange) -> SyncResult {
        let mut result = SyncResult::new(client.client_id.clone());

        let Some(provider) = self.providers.get(&client.provider) else {
            let error = SyncError::Config(format!("unknown provider {}", client.provider));
            tracing::error!(error = %error, "Cannot sync client");
            result.push(UnitOutcome {
                entity: "*".to_string(),
                status: UnitStatus::Failed,
                rows_written: 0,
                attempts: 0,
                error: Some(UnitError::from_error("*", &error)),
            });
            return result;
        };

        // One transport per client so a token exchange happens once per run
        let transport = provider.session(client.clone());
        let transport = &transport;

        // The unit semaphore caps how many of these run at once
        let units: Vec<_> = self
            .entities
            .iter()
            .filter(|e| e.provider() == client.provider)
            .map(|entity| self.run_unit(transport, entity.as_ref(), window).boxed())
            .collect();
        let outcomes = future::join_all(units).await;

        for outcome in outcomes {
            result.push(outcome);
        }

        tracing::info!(
            rows_written = result.rows_written,
            failed_units = result.errors.len(),
            "Client sync finished"
        );
        result
    }

    /// Synchronize several clients concurrently
    pub async fn sync_many(&self, clients: Vec<ClientContext>, window: TimeRange) -> Vec<SyncResult> {
        future::join_all(clients.into_iter().map(|client| self.sync(client, window))).await
    }

    async fn run_unit(&self, transport: &Transport, entity: &dyn EntitySync, window: TimeRange) -> UnitOutcome {
        let started_at = Utc::now();
        let client = transport.client();

        let UnitRun {
            result,
            rows_written,
            attempts,
        } = match self.units.acquire().await {
            Ok(_permit) => self.execute_unit(transport, entity, &window).await,
            Err(_) => UnitRun {
                result: Err(SyncError::Config("orchestrator is shutting down".to_string())),
                rows_written: 0,
                attempts: 0,
            },
        };

        let outcome = match result {
            Ok(()) => {
                tracing::info!(
                    client = %client.client_id,
                    entity = entity.name(),
                    rows_written,
                    attempts,
                    "Unit succeeded"
                );
                UnitOutcome {
                    entity: entity.name().to_string(),
                    status: UnitStatus::Succeeded,
                    rows_written,
                    attempts,
                    error: None,
                }
            }
            Err(error) => {
                tracing::error!(
                    client = %client.client_id,
                    entity = entity.name(),
                    attempts,
                    committed = rows_written,
                    kind = error.kind(),
                    error = %error,
                    "Unit failed"
                );
                UnitOutcome {
                    entity: entity.name().to_string(),
                    status: UnitStatus::Failed,
                    rows_written,
                    attempts,
                    error: Some(UnitError::from_error(entity.name(), &error)),
                }
            }
        };

        let run = SyncRun::from_outcome(&client.client_id, &window, &outcome, started_at);
        if let Err(e) = SyncRunRepository::new(self.gateway.pool()).record(&run).await {
            tracing::warn!(error = %e, entity = entity.name(), "Could not record sync run");
        }

        outcome
    }

    /// Fetch and reconcile once, then persist with unit-level retries.
    ///
    /// Only the persistence stage can fail on infrastructure, so a retry
    /// reuses the reconciled rows instead of resubmitting provider jobs.
    async fn execute_unit(
        &self,
        transport: &Transport,
        entity: &dyn EntitySync,
        window: &TimeRange,
    ) -> UnitRun {
        let rows = match self.collect_rows(transport, entity, window).await {
            Ok(rows) => rows,
            Err(e) => {
                return UnitRun {
                    result: Err(e),
                    rows_written: 0,
                    attempts: 1,
                }
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let persisted = self.persist(entity, &rows).await;

            match persisted.result {
                Err(e) if e.is_infrastructure() && attempt <= self.settings.unit_retries => {
                    tracing::warn!(
                        client = %transport.client().client_id,
                        entity = entity.name(),
                        attempt,
                        retries = self.settings.unit_retries,
                        committed = persisted.written,
                        error = %e,
                        "Infrastructure failure, retrying unit"
                    );
                    tokio::time::sleep(self.settings.unit_retry_delay).await;
                }
                result => {
                    // Batches committed before a failure stay in the store
                    if persisted.committed_rows > 0 {
                        self.deliver(
                            transport.client(),
                            entity,
                            &rows[..persisted.committed_rows],
                        )
                        .await;
                    }
                    return UnitRun {
                        result,
                        rows_written: persisted.written,
                        attempts: attempt,
                    }
                }
            }
        }
    }

    async fn collect_rows(
        &self,
        transport: &Transport,
        entity: &dyn EntitySync,
        window: &TimeRange,
    ) -> Result<Vec<ReconciledRow>> {
        let client = transport.client();
        let records: Vec<RawRecord> = match entity.source(client, window)? {
            EntitySource::Paginated(page) => {
                fetch(transport, page)
                    .and_then(|record| future::ready(entity.normalize(client, record)))
                    .try_collect()
                    .await?
            }
            EntitySource::Report {
                submit,
                protocol,
                parser,
            } => JobRunner::new(transport, &protocol)
                .run(&submit, parser.as_ref())
                .await?
                .into_iter()
                .map(|record| entity.normalize(client, record))
                .collect::<Result<_>>()?,
        };

        let schema = entity.schema();
        let rows = reconcile(records, &schema.key, &schema.merge_plan())?;
        Ok(rows.into_iter().map(|row| schema.project(row)).collect())
    }

    /// Upsert in batches, stopping at the first failed batch
    async fn persist(&self, entity: &dyn EntitySync, rows: &[ReconciledRow]) -> Persisted {
        let schema = entity.schema();
        let update_fields = schema.update_fields();
        let mut persisted = Persisted {
            result: Ok(()),
            written: 0,
            committed_rows: 0,
        };
        for chunk in rows.chunks(self.settings.batch_size.max(1)) {
            let batch = UpsertBatch::new(schema.table.clone(), chunk.to_vec());
            match self.gateway.upsert(batch, &schema.key, &update_fields).await {
                Ok(written) => {
                    persisted.written += written;
                    persisted.committed_rows += chunk.len();
                }
                Err(e) => {
                    persisted.result = Err(e);
                    break;
                }
            }
        }
        persisted
    }

    async fn deliver(&self, client: &ClientContext, entity: &dyn EntitySync, rows: &[ReconciledRow]) {
        for sink in &self.sinks {
            if let Err(e) = sink.accept(client, entity.name(), rows).await {
                tracing::warn!(entity = entity.name(), error = %e, "Row sink rejected rows");
            }
        }
    }
}
