//! Query-related data models.
//!
//! This module defines the positional parameters callers send, the operation kinds the
//! wrapper dispatches on, and the row shapes it hands back.

use crate::error::RawDbError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Maximum number of parameters kept in log records and error payloads.
pub const MAX_LOGGED_PARAMS: usize = 10;

/// A single result row: column name to raw value, case and format untouched.
pub type Row = serde_json::Map<String, JsonValue>;

/// A positional parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }

    /// Convert an arbitrary JSON value into the closest parameter variant.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Truncate a parameter list for logging.
pub fn truncate_params(params: &[QueryParam]) -> Vec<QueryParam> {
    params.iter().take(MAX_LOGGED_PARAMS).cloned().collect()
}

/// The driver verb a wrapped call maps to. All kinds share the same wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Exactly one row
    One,
    /// Zero or one row
    OneOrNone,
    /// One or more rows
    Many,
    /// Any number of rows
    ManyOrNone,
    /// Rows streamed from the driver one at a time
    Stream,
    /// No result rows expected
    None,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::One => "one",
            Self::OneOrNone => "one_or_none",
            Self::Many => "many",
            Self::ManyOrNone => "many_or_none",
            Self::Stream => "stream",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "one" => Ok(Self::One),
            "one_or_none" => Ok(Self::OneOrNone),
            "many" => Ok(Self::Many),
            "many_or_none" | "any" => Ok(Self::ManyOrNone),
            "stream" | "each" => Ok(Self::Stream),
            "none" => Ok(Self::None),
            other => Err(format!("unknown operation kind: {}", other)),
        }
    }
}

/// Result of a wrapped call, shaped by its [`OperationKind`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    One(Row),
    OneOrNone(Option<Row>),
    Many(Vec<Row>),
    Done { rows_affected: u64 },
}

impl QueryOutput {
    /// Shape fetched rows according to the operation kind.
    ///
    /// Shape violations are driver-level failures and go through classification
    /// like any other error.
    pub fn from_rows(kind: OperationKind, mut rows: Vec<Row>) -> Result<Self, RawDbError> {
        match kind {
            OperationKind::One => match rows.len() {
                0 => Err(RawDbError::result_shape("No data returned from the query.")),
                1 => Ok(Self::One(rows.remove(0))),
                _ => Err(RawDbError::result_shape("Multiple rows were not expected.")),
            },
            OperationKind::OneOrNone => match rows.len() {
                0 => Ok(Self::OneOrNone(None)),
                1 => Ok(Self::OneOrNone(Some(rows.remove(0)))),
                _ => Err(RawDbError::result_shape("Multiple rows were not expected.")),
            },
            OperationKind::Many if rows.is_empty() => {
                Err(RawDbError::result_shape("No data returned from the query."))
            }
            OperationKind::Many | OperationKind::ManyOrNone | OperationKind::Stream => {
                Ok(Self::Many(rows))
            }
            OperationKind::None if rows.is_empty() => Ok(Self::Done { rows_affected: 0 }),
            OperationKind::None => Err(RawDbError::result_shape("No return data was expected.")),
        }
    }

    /// Flatten into rows, whatever the shape.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::One(row) => vec![row],
            Self::OneOrNone(row) => row.into_iter().collect(),
            Self::Many(rows) => rows,
            Self::Done { .. } => Vec::new(),
        }
    }

    /// Get the number of rows carried by this output.
    pub fn row_count(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::OneOrNone(row) => usize::from(row.is_some()),
            Self::Many(rows) => rows.len(),
            Self::Done { .. } => 0,
        }
    }
}
