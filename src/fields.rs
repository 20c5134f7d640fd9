//! # Flat Fields
//!
//! Dotted-path view of a record body. Profiles and sessions are stored and
//! merged as flat `path -> value` maps rather than nested trees, so field
//! policies, per-field stamps and the merge engine all address data the same
//! way. Mutations feed a change log that is later folded into the record's
//! `metadata.fields` audit map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;
use crate::value::Value;

/// Path prefix of the per-field audit map inside a flattened profile.
/// Entries under it are bookkeeping, never merge input.
pub const FIELD_LOG_PREFIX: &str = "metadata.fields";

/// One logged mutation: when it happened and what the path held before.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub stamp: Stamp,
    pub previous: Value,
}

/// Flat `dotted path -> value` map with a mutation log.
///
/// The log intentionally ignores writes under [`FIELD_LOG_PREFIX`]; audit
/// bookkeeping must not audit itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatFields {
    values: BTreeMap<String, Value>,
    #[serde(skip)]
    changes: BTreeMap<String, FieldChange>,
}

impl FlatFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a nested value into dotted paths. Scalars, lists and empty
    /// maps are leaves; non-empty maps recurse.
    pub fn from_nested(value: &Value) -> Self {
        let mut fields = Self::new();
        flatten_into("", value, &mut fields.values);
        fields
    }

    /// Rebuild the nested tree. Paths sharing a prefix become nested maps;
    /// a scalar sitting on an interior path is replaced by the map below it.
    pub fn to_nested(&self) -> Value {
        let mut root = BTreeMap::new();
        for (path, value) in &self.values {
            nest_into(&mut root, path, value.clone());
        }
        Value::Map(root)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.values.contains_key(path)
    }

    /// Write without touching the change log. Construction-time and
    /// bookkeeping writes go through here.
    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(path.into(), value.into());
    }

    /// Write and log the previous value, unless the path is audit
    /// bookkeeping.
    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>, stamp: Stamp) {
        let path = path.into();
        let value = value.into();
        if !path.starts_with(FIELD_LOG_PREFIX) {
            let previous = self.values.get(&path).cloned().unwrap_or(Value::Null);
            self.changes.insert(path.clone(), FieldChange { stamp, previous });
        }
        self.values.insert(path, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Entries strictly below `prefix.`, yielded with the prefix stripped.
    /// Suffixes may themselves contain dots; callers must not re-split them.
    pub fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.values.iter().filter_map(move |(path, value)| {
            path.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|suffix| (suffix, value))
        })
    }

    /// The value rooted at `prefix`: the exact entry if one exists,
    /// otherwise a nested map assembled from the entries below `prefix.`.
    /// Returns `None` when the path is entirely absent.
    pub fn subtree(&self, prefix: &str) -> Option<Value> {
        if let Some(value) = self.values.get(prefix) {
            return Some(value.clone());
        }
        let mut root = BTreeMap::new();
        for (suffix, value) in self.prefixed(prefix) {
            nest_into(&mut root, suffix, value.clone());
        }
        if root.is_empty() {
            None
        } else {
            Some(Value::Map(root))
        }
    }

    /// Union in every entry of `other`, `other` winning on collision. Not
    /// logged; used when a session absorbs payload context.
    pub fn extend_from(&mut self, other: &FlatFields) {
        for (path, value) in &other.values {
            self.values.insert(path.clone(), value.clone());
        }
    }

    pub fn changes(&self) -> &BTreeMap<String, FieldChange> {
        &self.changes
    }

    /// Drain the change log. Callers fold the entries into the record's
    /// `metadata.fields` audit map before persisting.
    pub fn take_changes(&mut self) -> BTreeMap<String, FieldChange> {
        std::mem::take(&mut self.changes)
    }
}

/// Dot-boundary prefix test: `a.b` is under `a`, `a.bc` is not.
pub(crate) fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'.'))
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Map(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, child, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
}

fn nest_into(root: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            root.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = root
                .entry(head.to_string())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if !matches!(slot, Value::Map(_)) {
                *slot = Value::Map(BTreeMap::new());
            }
            if let Value::Map(map) = slot {
                nest_into(map, rest, value);
            }
        }
    }
}
