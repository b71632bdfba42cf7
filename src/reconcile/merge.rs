//! Per-field merge functions

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, SyncError};
use crate::pagination::json_type;

/// How values of one field combine when records share a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFn {
    Sum,
    /// The latest record in iteration order wins
    LastWriteWins,
    FirstWriteWins,
    Max,
    Min,
}

impl MergeFn {
    fn is_numeric(&self) -> bool {
        matches!(self, MergeFn::Sum | MergeFn::Max | MergeFn::Min)
    }

    /// Fold `incoming` into the value accumulated so far.
    ///
    /// Numeric merges skip nulls and accept numeric strings.
    pub fn combine(&self, field: &str, current: Option<&Value>, incoming: &Value) -> Result<Value> {
        match self {
            MergeFn::LastWriteWins => Ok(incoming.clone()),
            MergeFn::FirstWriteWins => Ok(current.cloned().unwrap_or_else(|| incoming.clone())),
            numeric => {
                let incoming = to_number(field, incoming)?;
                let current = match current {
                    Some(value) => to_number(field, value)?,
                    None => None,
                };
                let merged = match (current, incoming) {
                    (None, None) => return Ok(Value::Null),
                    (Some(a), None) => a,
                    (None, Some(b)) => b,
                    (Some(a), Some(b)) => match numeric {
                        MergeFn::Sum => add(field, &a, &b)?,
                        MergeFn::Max => pick(&a, &b, |x, y| x >= y),
                        _ => pick(&a, &b, |x, y| x <= y),
                    },
                };
                Ok(Value::Number(merged))
            }
        }
    }
}

fn to_number(field: &str, value: &Value) -> Result<Option<Number>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(Some(n.clone())),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Some(Number::from(i)));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Some)
                .ok_or_else(|| {
                    SyncError::Reconcile(format!("field '{}' is not numeric: {:?}", field, s))
                })
        }
        other => Err(SyncError::Reconcile(format!(
            "field '{}' is not numeric: found {}",
            field,
            json_type(other)
        ))),
    }
}

fn add(field: &str, a: &Number, b: &Number) -> Result<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Number::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .ok_or_else(|| SyncError::Reconcile(format!("sum of field '{}' is not finite", field)))
}

fn pick(a: &Number, b: &Number, keep_first: impl Fn(f64, f64) -> bool) -> Number {
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    if keep_first(x, y) {
        a.clone()
    } else {
        b.clone()
    }
}

/// Merge function selection for one entity type.
///
/// Explicit overrides win; declared numeric fields default to
/// [`MergeFn::Sum`]; everything else is [`MergeFn::LastWriteWins`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    #[serde(default)]
    numeric: HashSet<String>,
    #[serde(default)]
    overrides: HashMap<String, MergeFn>,
}

impl MergePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn numeric<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.numeric.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with(mut self, field: impl Into<String>, merge: MergeFn) -> Self {
        self.overrides.insert(field.into(), merge);
        self
    }

    pub fn merge_for(&self, field: &str) -> MergeFn {
        if let Some(merge) = self.overrides.get(field) {
            return *merge;
        }
        if self.numeric.contains(field) {
            MergeFn::Sum
        } else {
            MergeFn::LastWriteWins
        }
    }

    /// Whether a field's first value needs numeric normalization
    pub(super) fn normalizes(&self, field: &str) -> bool {
        self.merge_for(field).is_numeric()
    }
}
