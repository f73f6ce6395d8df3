//! Column types and typed cell values
//!
//! Raw items coming out of fetch resolvers are untyped JSON. Every column
//! declares a [`ColumnType`] and the engine converts whatever its resolver
//! produced into a [`Cell`] of that type before the row is emitted.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    String,
    Json,
    Timestamp,
    StringArray,
    Uuid,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Json => "json",
            Self::Timestamp => "timestamp",
            Self::StringArray => "string_array",
            Self::Uuid => "uuid",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, typed column value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Json(Value),
    Timestamp(DateTime<Utc>),
    StringArray(Vec<String>),
    Uuid(Uuid),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert back into JSON (used by sinks and by parent column lookups)
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Int(i) => Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::String(s) => Value::String(s.clone()),
            Cell::Json(v) => v.clone(),
            Cell::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            Cell::StringArray(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            Cell::Uuid(id) => Value::String(id.to_string()),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Error converting a raw value into a column type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot convert {found} to {expected}")]
pub struct ConversionError {
    pub expected: ColumnType,
    pub found: String,
}

impl ConversionError {
    fn new(expected: ColumnType, value: &Value) -> Self {
        let found = match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("bool {}", b),
            Value::Number(n) => format!("number {}", n),
            Value::String(s) => format!("string {:?}", truncate(s, 40)),
            Value::Array(arr) => format!("array of {} items", arr.len()),
            Value::Object(_) => "object".to_string(),
        };
        Self { expected, found }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Convert a raw JSON value into a typed cell
pub fn convert(value: Value, column_type: ColumnType) -> Result<Cell, ConversionError> {
    if value.is_null() {
        return Ok(Cell::Null);
    }

    match column_type {
        ColumnType::Json => Ok(Cell::Json(value)),
        ColumnType::Bool => match &value {
            Value::Bool(b) => Ok(Cell::Bool(*b)),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" => Ok(Cell::Bool(true)),
                "false" => Ok(Cell::Bool(false)),
                _ => Err(ConversionError::new(column_type, &value)),
            },
            _ => Err(ConversionError::new(column_type, &value)),
        },
        ColumnType::Int => match &value {
            Value::Number(n) => n
                .as_i64()
                .map(Cell::Int)
                .ok_or_else(|| ConversionError::new(column_type, &value)),
            // GCP encodes int64 fields as strings
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Cell::Int)
                .map_err(|_| ConversionError::new(column_type, &value)),
            _ => Err(ConversionError::new(column_type, &value)),
        },
        ColumnType::Float => match &value {
            Value::Number(n) => n
                .as_f64()
                .map(Cell::Float)
                .ok_or_else(|| ConversionError::new(column_type, &value)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Cell::Float)
                .map_err(|_| ConversionError::new(column_type, &value)),
            _ => Err(ConversionError::new(column_type, &value)),
        },
        ColumnType::String => match value {
            Value::String(s) => Ok(Cell::String(s)),
            Value::Number(n) => Ok(Cell::String(n.to_string())),
            Value::Bool(b) => Ok(Cell::String(b.to_string())),
            other => Err(ConversionError::new(column_type, &other)),
        },
        ColumnType::Timestamp => match &value {
            Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|ts| Cell::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|_| ConversionError::new(column_type, &value)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .map(Cell::Timestamp)
                .ok_or_else(|| ConversionError::new(column_type, &value)),
            _ => Err(ConversionError::new(column_type, &value)),
        },
        ColumnType::StringArray => match &value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    _ => Err(ConversionError::new(column_type, &value)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Cell::StringArray),
            Value::String(s) => Ok(Cell::StringArray(vec![s.clone()])),
            _ => Err(ConversionError::new(column_type, &value)),
        },
        ColumnType::Uuid => match &value {
            Value::String(s) => Uuid::parse_str(s.trim())
                .map(Cell::Uuid)
                .map_err(|_| ConversionError::new(column_type, &value)),
            _ => Err(ConversionError::new(column_type, &value)),
        },
    }
}

/// Look up a value in JSON using a dot-notation path.
///
/// Numeric segments index into arrays, e.g. `networkInterfaces.0.network`.
/// An empty path returns the item itself.
pub fn lookup<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(item);
    }

    let mut current = item;
    for part in path.split('.') {
        current = match current {
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            Value::Object(map) => map.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Convert a snake_case column name into the lowerCamelCase field name
/// most JSON APIs use (`self_link` -> `selfLink`).
pub fn lower_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;

    for c in name.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
