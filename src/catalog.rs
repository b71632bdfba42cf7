//! Provider, entity and client catalog
//!
//! The catalog is a JSON document describing which provider APIs exist, which
//! entities are pulled from them and into which tables, and which client
//! accounts to synchronize. Entities defined here are config-driven
//! [`EntitySync`] implementations whose requests are rendered per unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::db::UpsertGateway;
use crate::error::{Result, SyncError};
use crate::jobs::{ArtifactFormat, JobProtocol};
use crate::pagination::{CursorPlacement, PageRequest, PaginationStyle, DEFAULT_MAX_PAGES};
use crate::reconcile::RawRecord;
use crate::sync::{
    ClientContext, EntitySchema, EntitySource, EntitySync, SyncOrchestrator, SyncSettings,
    TimeRange, CLIENT_SCOPE_FIELD,
};
use crate::transport::{Provider, ProviderConfig, Request};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub providers: Vec<ProviderConfig>,
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub clients: Vec<ClientContext>,
}

impl Catalog {
    /// Read and validate a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(text)
            .map_err(|e| SyncError::Config(format!("invalid catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let mut providers = HashSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "provider {} is declared twice",
                    provider.name
                )));
            }
            provider.retry.validate()?;
            if provider.max_in_flight == 0 {
                return Err(SyncError::Config(format!(
                    "provider {} needs max_in_flight of at least 1",
                    provider.name
                )));
            }
        }

        let mut entities = HashSet::new();
        let mut tables = HashSet::new();
        for entity in &self.entities {
            if !entities.insert(entity.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "entity {} is declared twice",
                    entity.name
                )));
            }
            if !tables.insert(entity.schema.table.as_str()) {
                return Err(SyncError::Config(format!(
                    "table {} is used by more than one entity",
                    entity.schema.table
                )));
            }
            if !providers.contains(entity.provider.as_str()) {
                return Err(SyncError::Config(format!(
                    "entity {} references unknown provider {}",
                    entity.name, entity.provider
                )));
            }
            entity.schema.validate()?;
        }

        let mut clients = HashSet::new();
        for client in &self.clients {
            if !providers.contains(client.provider.as_str()) {
                return Err(SyncError::Config(format!(
                    "client {} references unknown provider {}",
                    client.client_id, client.provider
                )));
            }
            if !clients.insert((client.provider.as_str(), client.client_id.as_str())) {
                return Err(SyncError::Config(format!(
                    "client {} of provider {} is declared twice",
                    client.client_id, client.provider
                )));
            }
        }

        Ok(())
    }

    /// Client ids are only unique within their provider
    pub fn client(&self, provider: &str, client_id: &str) -> Option<&ClientContext> {
        self.clients
            .iter()
            .find(|c| c.provider == provider && c.client_id == client_id)
    }

    /// Orchestrator with a reqwest-backed engine per provider
    pub fn build_orchestrator(&self, gateway: UpsertGateway, settings: SyncSettings) -> Result<SyncOrchestrator> {
        let providers = self
            .providers
            .iter()
            .map(|config| Provider::from_config(config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.assemble(providers, gateway, settings))
    }

    /// Orchestrator over already built providers
    pub fn assemble(
        &self,
        providers: Vec<Arc<Provider>>,
        gateway: UpsertGateway,
        settings: SyncSettings,
    ) -> SyncOrchestrator {
        let orchestrator = providers
            .into_iter()
            .fold(SyncOrchestrator::new(gateway, settings), |o, p| o.with_provider(p));
        self.entities.iter().fold(orchestrator, |o, entity| {
            o.with_entity(Arc::new(entity.clone()) as Arc<dyn EntitySync>)
        })
    }
}

/// HTTP method of a templated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateMethod {
    #[default]
    Get,
    Post,
}

/// A provider request with `{client_id}`, `{from}`, `{to}`, `{from_date}`
/// and `{to_date}` placeholders in its path, query values and body strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default)]
    pub method: TemplateMethod,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Whether the endpoint may be retried; listing endpoints default to yes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

struct Placeholders(Vec<(&'static str, String)>);

impl Placeholders {
    fn new(client: &ClientContext, window: &TimeRange) -> Self {
        Self(vec![
            ("{client_id}", client.client_id.clone()),
            ("{from_date}", window.from.format("%Y-%m-%d").to_string()),
            ("{to_date}", window.to.format("%Y-%m-%d").to_string()),
            ("{from}", window.from.to_rfc3339()),
            ("{to}", window.to.to_rfc3339()),
        ])
    }

    fn apply(&self, text: &str) -> String {
        self.0
            .iter()
            .fold(text.to_string(), |acc, (name, value)| acc.replace(name, value))
    }

    fn apply_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.apply(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.apply_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.apply_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl RequestTemplate {
    pub fn render(&self, client: &ClientContext, window: &TimeRange, default_idempotent: bool) -> Request {
        let vars = Placeholders::new(client, window);
        let path = vars.apply(&self.path);
        let mut request = match self.method {
            TemplateMethod::Get => Request::get(path),
            TemplateMethod::Post => Request::post(path),
        };
        for (name, value) in &self.query {
            request = request.with_query(name.clone(), vars.apply(value));
        }
        if let Some(body) = &self.body {
            request = request.with_body(vars.apply_value(body));
        }
        request.idempotent = self.idempotent.unwrap_or(match self.method {
            TemplateMethod::Get => true,
            TemplateMethod::Post => default_idempotent,
        });
        request
    }
}

/// Where a catalog entity's records come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceTemplate {
    Paginated {
        request: RequestTemplate,
        pagination: PaginationStyle,
        #[serde(default)]
        items_pointer: String,
        #[serde(default)]
        cursor_placement: CursorPlacement,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
    },
    Report {
        submit: RequestTemplate,
        job: JobProtocol,
        #[serde(default)]
        artifact: ArtifactFormat,
    },
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

/// A config-driven entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    pub provider: String,
    pub schema: EntitySchema,
    pub source: SourceTemplate,
    /// Column name to JSON pointer into the raw record. Empty keeps records as they are.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl EntitySync for EntityDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn source(&self, client: &ClientContext, window: &TimeRange) -> Result<EntitySource> {
        Ok(match &self.source {
            SourceTemplate::Paginated {
                request,
                pagination,
                items_pointer,
                cursor_placement,
                max_pages,
            } => EntitySource::Paginated(
                PageRequest::new(request.render(client, window, true), pagination.clone())
                    .with_items_pointer(items_pointer.clone())
                    .with_placement(*cursor_placement)
                    .with_max_pages(*max_pages),
            ),
            SourceTemplate::Report {
                submit,
                job,
                artifact,
            } => EntitySource::Report {
                submit: submit.render(client, window, false),
                protocol: job.clone(),
                parser: artifact.parser(),
            },
        })
    }

    fn normalize(&self, client: &ClientContext, record: RawRecord) -> Result<RawRecord> {
        let mut record = if self.fields.is_empty() {
            record
        } else {
            let source = Value::Object(record);
            self.fields
                .iter()
                .map(|(column, pointer)| {
                    let value = source.pointer(pointer).cloned().unwrap_or(Value::Null);
                    (column.clone(), value)
                })
                .collect()
        };
        record.insert(
            CLIENT_SCOPE_FIELD.to_string(),
            Value::String(client.client_id.clone()),
        );
        Ok(record)
    }
}
