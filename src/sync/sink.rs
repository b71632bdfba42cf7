//! Export boundary for persisted rows

use async_trait::async_trait;
use std::sync::Mutex;

use super::ClientContext;
use crate::error::Result;
use crate::reconcile::ReconciledRow;

/// Receives the canonical rows of a unit once they are persisted.
///
/// Spreadsheet and report exporters implement this. A sink failure is logged
/// and does not fail the unit, since the rows are already stored.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn accept(&self, client: &ClientContext, entity: &str, rows: &[ReconciledRow]) -> Result<()>;
}

/// Rows delivered to a [`CollectingSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedRows {
    pub client_id: String,
    pub entity: String,
    pub rows: Vec<ReconciledRow>,
}

/// Keeps delivered rows in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    delivered: Mutex<Vec<CollectedRows>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<CollectedRows> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RowSink for CollectingSink {
    async fn accept(&self, client: &ClientContext, entity: &str, rows: &[ReconciledRow]) -> Result<()> {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(CollectedRows {
                client_id: client.client_id.clone(),
                entity: entity.to_string(),
                rows: rows.to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{BusinessKey, KeyValue};
    use crate::test_support::client_context;

    #[tokio::test]
    async fn test_collecting_sink_keeps_deliveries() {
        let sink = CollectingSink::new();
        let row = ReconciledRow {
            key: BusinessKey(vec![KeyValue::Text("A".into())]),
            fields: Default::default(),
        };
        sink.accept(&client_context(), "orders", &[row.clone()])
            .await
            .unwrap();

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].client_id, "client-1");
        assert_eq!(delivered[0].entity, "orders");
        assert_eq!(delivered[0].rows, vec![row]);
    }
}
