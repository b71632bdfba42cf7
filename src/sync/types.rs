//! Sync data types
//!
//! Client credentials, time windows, and the per-unit outcome reporting
//! returned by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SyncError};

/// Credentials of one marketplace account.
///
/// Immutable for the duration of a run and passed by value into each unit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContext {
    /// Provider this account belongs to
    pub provider: String,
    pub client_id: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
}

impl ClientContext {
    pub fn new(
        provider: impl Into<String>,
        client_id: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: Option<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            client_id: client_id.into(),
            api_key: api_key.into(),
            api_secret,
        }
    }
}

// Keep credentials out of logs
impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("api_key", &"***")
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Inclusive time window a unit synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(SyncError::Config(format!(
                "window start {} is after window end {}",
                from.to_rfc3339(),
                to.to_rfc3339()
            )));
        }
        Ok(Self { from, to })
    }
}

/// Final state of one (client, entity) unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Succeeded,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Failed => "failed",
        }
    }
}

/// Outcome of one unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub entity: String,
    pub status: UnitStatus,
    /// Rows committed by the unit; a failed unit may have committed earlier batches
    pub rows_written: u64,
    /// Number of times the unit ran (1 unless retried on infrastructure failure)
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
}

/// A unit failure as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub entity: String,
    /// Error class label, see [`SyncError::kind`]
    pub kind: String,
    pub message: String,
}

impl UnitError {
    pub fn from_error(entity: &str, error: &SyncError) -> Self {
        Self {
            entity: entity.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result of synchronizing one client over one window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub client_id: String,
    pub rows_written: u64,
    pub errors: Vec<UnitError>,
    pub outcomes: Vec<UnitOutcome>,
}

impl SyncResult {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, outcome: UnitOutcome) {
        self.rows_written += outcome.rows_written;
        if let Some(error) = &outcome.error {
            self.errors.push(error.clone());
        }
        self.outcomes.push(outcome);
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}
