//! # Value
//!
//! Tagged value container for profile and session field trees. Stored
//! records are dynamically shaped, so every field the merge engine touches
//! is one of these; the strategy coercions (numeric, boolean word forms,
//! datetime parsing, emptiness) live here next to the data they interpret.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::clock::Stamp;

/// A dynamically typed field value.
///
/// Integers and floats are kept apart so that counters survive merging
/// without turning into floats; numeric comparisons coerce through [`Value::as_f64`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// True for `null`, `""`, `[]` and `{}`.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Map(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Numeric reading. Booleans and numeric strings do not qualify; the
    /// arithmetic strategies are strict about input types.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Boolean reading with the tracking-payload word forms: `true`/`false`,
    /// the integer `1`, and the case-insensitive strings `1`, `yes`, `true`,
    /// `on`. Any other shape is not boolean-like.
    pub fn as_bool_like(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i == 1),
            Value::String(s) => {
                let lower = s.to_lowercase();
                Some(matches!(lower.as_str(), "1" | "yes" | "true" | "on"))
            }
            _ => None,
        }
    }

    /// Datetime reading: RFC 3339 strings (a missing offset is taken as
    /// UTC, a space separator is tolerated) or epoch-second numbers.
    pub fn as_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            Value::String(s) => parse_datetime(s),
            Value::Int(i) => OffsetDateTime::from_unix_timestamp(*i).ok(),
            Value::Float(f) => {
                OffsetDateTime::from_unix_timestamp_nanos((*f * 1e9) as i128).ok()
            }
            _ => None,
        }
    }

    /// Epoch-second reading used for field stamps, which arrive either as
    /// raw numbers or as rendered datetimes.
    pub fn as_stamp(&self) -> Option<Stamp> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(_) => self
                .as_datetime()
                .map(|dt| dt.unix_timestamp_nanos() as f64 / 1e9),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

/// Parse a datetime string. Accepts RFC 3339; strings without an offset are
/// normalized to UTC and a space date/time separator is rewritten to `T`.
fn parse_datetime(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(dt);
    }
    let mut normalized = trimmed.replacen(' ', "T", 1);
    let has_offset = normalized
        .split_once('T')
        .map(|(_, time)| {
            time.ends_with('Z') || time.ends_with('z') || time.contains('+') || time.contains('-')
        })
        .unwrap_or(false);
    if !has_offset {
        normalized.push('Z');
    }
    OffsetDateTime::parse(&normalized, &Rfc3339).ok()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{key}\": {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}
