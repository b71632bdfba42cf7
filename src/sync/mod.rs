//! Sync orchestration
//!
//! Wires transport, pagination, report jobs, reconciliation and persistence
//! together for one (client, time window) unit of work per entity.

mod entity;
mod orchestrator;
mod sink;
mod types;

pub use entity::{
    ColumnKind, ColumnSpec, EntitySchema, EntitySource, EntitySync, CLIENT_SCOPE_FIELD,
};
pub use orchestrator::{SyncOrchestrator, SyncSettings};
pub use sink::{CollectedRows, CollectingSink, RowSink};
pub use types::{ClientContext, SyncResult, TimeRange, UnitError, UnitOutcome, UnitStatus};
