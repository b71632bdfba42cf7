//! Reconciliation
//!
//! Providers report one business fact as several line items. Records are
//! grouped by business key and collapsed into exactly one row per key before
//! they reach the store.

mod key;
mod merge;

pub use key::{BusinessKey, KeyFields, KeyValue};
pub use merge::{MergeFn, MergePlan};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::Result;

/// A provider-shaped record
pub type RawRecord = Map<String, Value>;

/// All records sharing one key, merged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRow {
    pub key: BusinessKey,
    pub fields: Map<String, Value>,
}

/// Group records by key and merge each group field by field.
///
/// Rows come out in the order their key was first seen. Key fields keep the
/// value of the first record; a field missing from a later record leaves the
/// accumulated value as it is.
pub fn reconcile<I>(records: I, key: &KeyFields, plan: &MergePlan) -> Result<Vec<ReconciledRow>>
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut index: HashMap<BusinessKey, usize> = HashMap::new();
    let mut rows: Vec<ReconciledRow> = Vec::new();
    let mut seen = 0usize;

    for record in records {
        seen += 1;
        let business_key = key.key_of(&record)?;

        let slot = match index.get(&business_key) {
            Some(&slot) => slot,
            None => {
                index.insert(business_key.clone(), rows.len());
                rows.push(ReconciledRow {
                    key: business_key,
                    fields: Map::new(),
                });
                rows.len() - 1
            }
        };

        let fields = &mut rows[slot].fields;
        for (name, value) in record {
            if key.contains(&name) {
                fields.entry(name).or_insert(value);
                continue;
            }
            let merged = if fields.contains_key(&name) || plan.normalizes(&name) {
                plan.merge_for(&name).combine(&name, fields.get(&name), &value)?
            } else {
                value
            };
            fields.insert(name, merged);
        }
    }

    tracing::debug!(records = seen, rows = rows.len(), "Reconciled records");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;

    fn records(values: Vec<Value>) -> Vec<RawRecord> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_sum_aggregation_by_key() {
        let input = records(vec![
            json!({"date": "2024-01-01", "sku": "A", "qty": 3}),
            json!({"date": "2024-01-01", "sku": "A", "qty": 5}),
            json!({"date": "2024-01-01", "sku": "B", "qty": 2}),
        ]);
        let key = KeyFields::new(["date", "sku"]);
        let plan = MergePlan::new().numeric(["qty"]);

        let rows = reconcile(input, &key, &plan).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key.to_string(), "(2024-01-01, A)");
        assert_eq!(rows[0].fields["qty"], json!(8));
        assert_eq!(rows[1].key.to_string(), "(2024-01-01, B)");
        assert_eq!(rows[1].fields["qty"], json!(2));
    }

    #[test]
    fn test_last_write_wins_for_other_fields() {
        let input = records(vec![
            json!({"posting": "P1", "status": "new", "amount": "10.5"}),
            json!({"posting": "P1", "status": "delivered"}),
            json!({"posting": "P1", "status": null, "amount": 4.5}),
        ]);
        let key = KeyFields::new(["posting"]);
        let plan = MergePlan::new().numeric(["amount"]);

        let rows = reconcile(input, &key, &plan).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["status"], Value::Null);
        assert_eq!(rows[0].fields["amount"], json!(15.0));
        assert_eq!(rows[0].fields["posting"], json!("P1"));
    }

    #[test]
    fn test_numeric_key_field_is_not_summed() {
        let input = records(vec![
            json!({"sku": 7, "qty": 1}),
            json!({"sku": 7, "qty": 1}),
        ]);
        let key = KeyFields::new(["sku"]);
        let plan = MergePlan::new().numeric(["sku", "qty"]);

        let rows = reconcile(input, &key, &plan).unwrap();
        assert_eq!(rows[0].fields["sku"], json!(7));
        assert_eq!(rows[0].fields["qty"], json!(2));
    }

    #[test]
    fn test_output_cardinality_matches_distinct_keys() {
        let input: Vec<RawRecord> = (0..100)
            .map(|i| {
                json!({"sku": format!("S{}", i % 7), "qty": 1})
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect();
        let rows = reconcile(input, &KeyFields::new(["sku"]), &MergePlan::new().numeric(["qty"]))
            .unwrap();

        assert_eq!(rows.len(), 7);
        let total: i64 = rows.iter().map(|r| r.fields["qty"].as_i64().unwrap()).sum();
        assert_eq!(total, 100);
        assert_eq!(rows[0].fields["sku"], json!("S0"));
    }

    #[test]
    fn test_missing_key_field_fails() {
        let input = records(vec![json!({"qty": 1})]);
        let err = reconcile(input, &KeyFields::new(["sku"]), &MergePlan::new()).unwrap_err();
        assert!(matches!(err, SyncError::Reconcile(_)));
    }

    #[test]
    fn test_empty_input() {
        let rows = reconcile(Vec::new(), &KeyFields::new(["sku"]), &MergePlan::new()).unwrap();
        assert!(rows.is_empty());
    }
}
