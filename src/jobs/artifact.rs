//! Report artifact parsing

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pagination::json_type;
use crate::reconcile::RawRecord;

/// A downloaded artifact could not be turned into records
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ArtifactError(pub String);

/// Turns downloaded report bytes into records.
///
/// Spreadsheet and CSV layouts live with the provider integrations that
/// need them.
pub trait ArtifactParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRecord>, ArtifactError>;
}

/// JSON report: an array of objects at `items_pointer`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonArtifact {
    #[serde(default)]
    pub items_pointer: String,
}

impl JsonArtifact {
    pub fn new(items_pointer: impl Into<String>) -> Self {
        Self {
            items_pointer: items_pointer.into(),
        }
    }
}

impl ArtifactParser for JsonArtifact {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRecord>, ArtifactError> {
        let document: Value = serde_json::from_slice(bytes)
            .map_err(|e| ArtifactError(format!("invalid JSON artifact: {}", e)))?;

        let items = match document.pointer(&self.items_pointer) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ArtifactError(format!(
                    "expected an array at '{}', found {}",
                    self.items_pointer,
                    json_type(other)
                )))
            }
            None => {
                return Err(ArtifactError(format!(
                    "artifact has nothing at '{}'",
                    self.items_pointer
                )))
            }
        };

        items
            .iter()
            .map(|item| {
                item.as_object()
                    .cloned()
                    .ok_or_else(|| ArtifactError(format!("non-object row: {}", json_type(item))))
            })
            .collect()
    }
}

/// Artifact format as named in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ArtifactFormat {
    Json(JsonArtifact),
}

impl ArtifactFormat {
    pub fn parser(&self) -> Box<dyn ArtifactParser> {
        match self {
            ArtifactFormat::Json(json) => Box::new(json.clone()),
        }
    }
}

impl Default for ArtifactFormat {
    fn default() -> Self {
        ArtifactFormat::Json(JsonArtifact::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_array() {
        let rows = JsonArtifact::default()
            .parse(br#"[{"sku": "A", "qty": 1}, {"sku": "B", "qty": 2}]"#)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["sku"], "B");
    }

    #[test]
    fn test_nested_items() {
        let parser = JsonArtifact::new("/report/rows");
        let rows = parser.parse(br#"{"report": {"rows": [{"a": 1}]}}"#).unwrap();
        assert_eq!(rows.len(), 1);

        assert!(parser.parse(br#"{"report": {}}"#).is_err());
        assert!(parser.parse(br#"{"report": {"rows": [1]}}"#).is_err());
        assert!(parser.parse(b"not json").is_err());
    }

    #[test]
    fn test_catalog_format() {
        let format: ArtifactFormat = serde_json::from_value(serde_json::json!({
            "format": "json",
            "items_pointer": "/rows"
        }))
        .unwrap();
        assert_eq!(format, ArtifactFormat::Json(JsonArtifact::new("/rows")));
    }
}
