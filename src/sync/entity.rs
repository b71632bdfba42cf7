//! Entity types the orchestrator can synchronize

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::{ClientContext, TimeRange};
use crate::db::check_identifier;
use crate::error::{Result, SyncError};
use crate::jobs::{ArtifactParser, JobProtocol};
use crate::pagination::PageRequest;
use crate::reconcile::{KeyFields, MergeFn, MergePlan, RawRecord, ReconciledRow};
use crate::transport::Request;

/// Column every record is scoped by; part of every business key
pub const CLIENT_SCOPE_FIELD: &str = "client_id";

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[default]
    Text,
    Integer,
    Real,
    /// Nested values stored as JSON text
    Json,
}

impl ColumnKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Real)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ColumnKind,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Overrides the default merge (sum for numeric columns, last write wins otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeFn>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            merge: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Where an entity's table lives and how its rows are keyed and merged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub table: String,
    pub key: KeyFields,
    pub columns: Vec<ColumnSpec>,
    /// Columns overwritten when a row with the same key already exists.
    /// Defaults to every non-key column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_fields: Option<Vec<String>>,
}

impl EntitySchema {
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.table)?;
        if self.key.is_empty() {
            return Err(SyncError::Config(format!(
                "table {} declares an empty business key",
                self.table
            )));
        }
        if !self.key.contains(CLIENT_SCOPE_FIELD) {
            return Err(SyncError::Config(format!(
                "business key of table {} must include {} so clients never share rows",
                self.table, CLIENT_SCOPE_FIELD
            )));
        }

        let mut names = HashSet::new();
        for column in &self.columns {
            check_identifier(&column.name)?;
            if !names.insert(column.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "table {} declares column {} twice",
                    self.table, column.name
                )));
            }
        }

        for field in self.key.fields() {
            if !names.contains(field.as_str()) {
                return Err(SyncError::Config(format!(
                    "key field {} of table {} is not a column",
                    field, self.table
                )));
            }
        }

        for field in self.update_fields() {
            if !names.contains(field.as_str()) {
                return Err(SyncError::Config(format!(
                    "update field {} of table {} is not a column",
                    field, self.table
                )));
            }
            if self.key.contains(&field) {
                return Err(SyncError::Config(format!(
                    "update field {} of table {} is part of the key",
                    field, self.table
                )));
            }
        }

        Ok(())
    }

    pub fn update_fields(&self) -> Vec<String> {
        match &self.update_fields {
            Some(fields) => fields.clone(),
            None => self
                .columns
                .iter()
                .filter(|c| !self.key.contains(&c.name))
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    pub fn merge_plan(&self) -> MergePlan {
        let numeric = self
            .columns
            .iter()
            .filter(|c| c.kind.is_numeric())
            .map(|c| c.name.clone());
        self.columns
            .iter()
            .filter_map(|c| c.merge.map(|m| (c.name.clone(), m)))
            .fold(MergePlan::new().numeric(numeric), |plan, (name, merge)| {
                plan.with(name, merge)
            })
    }

    /// Keep only declared columns, filling absent ones with null
    pub fn project(&self, row: ReconciledRow) -> ReconciledRow {
        let ReconciledRow { key, mut fields } = row;
        let projected: Map<String, Value> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), fields.remove(&c.name).unwrap_or(Value::Null)))
            .collect();
        ReconciledRow {
            key,
            fields: projected,
        }
    }
}

/// Where an entity's records come from for one unit
pub enum EntitySource {
    /// A paginated listing endpoint
    Paginated(PageRequest),
    /// A report job and the parser for its artifact
    Report {
        submit: Request,
        protocol: JobProtocol,
        parser: Box<dyn ArtifactParser>,
    },
}

/// An entity type the orchestrator knows how to synchronize
pub trait EntitySync: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the provider serving this entity
    fn provider(&self) -> &str;

    fn schema(&self) -> &EntitySchema;

    /// Build the fetch for one client and window
    fn source(&self, client: &ClientContext, window: &TimeRange) -> Result<EntitySource>;

    /// Provider-specific field mapping applied to each raw record.
    ///
    /// The default scopes every record to its client by setting `client_id`.
    fn normalize(&self, client: &ClientContext, mut record: RawRecord) -> Result<RawRecord> {
        record.insert(
            CLIENT_SCOPE_FIELD.to_string(),
            Value::String(client.client_id.clone()),
        );
        Ok(record)
    }
}
