//! Business keys

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::RawRecord;
use crate::error::{Result, SyncError};
use crate::pagination::json_type;

/// One component of a business key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    /// Strings, and numbers that are not integers (kept in their JSON spelling)
    Text(String),
}

impl KeyValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => KeyValue::Int(i),
                None => KeyValue::Text(n.to_string()),
            }),
            Value::String(s) => Some(KeyValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Ordered tuple of field values identifying one fact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessKey(pub Vec<KeyValue>);

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

/// The declared key fields of an entity type.
///
/// Every component must be present and scalar; a null component would let
/// the store keep duplicate rows, so it is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyFields(Vec<String>);

impl KeyFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|f| f == field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extract the business key of a record
    pub fn key_of(&self, record: &RawRecord) -> Result<BusinessKey> {
        self.0
            .iter()
            .map(|field| {
                let value = record.get(field).ok_or_else(|| {
                    SyncError::Reconcile(format!("record is missing key field '{}'", field))
                })?;
                KeyValue::from_json(value).ok_or_else(|| {
                    SyncError::Reconcile(format!(
                        "key field '{}' must be a non-null scalar, found {}",
                        field,
                        json_type(value)
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(BusinessKey)
    }
}
