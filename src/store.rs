//! # Record Store
//!
//! Persistence boundary for profiles, sessions and events. The tracker only
//! talks to [`RecordStore`], so production deployments can back it with a
//! search index while tests run against [`MemoryStore`].
//!
//! The trait mirrors an index-backed store: writes become visible to queries
//! after [`RecordStore::refresh`], duplicate discovery is a bounded query,
//! and re-pointing foreign keys is a bulk update.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::Stamp;
use crate::error::{Error, Result};
use crate::fields::FlatFields;
use crate::model::RecordMetadata;
use crate::value::Value;

/// The three record families the tracker persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Profile,
    Session,
    Event,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Profile => "profile",
            RecordKind::Session => "session",
            RecordKind::Event => "event",
        }
    }
}

/// A record as the store sees it: flattened fields plus storage metadata.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub fields: FlatFields,
    pub meta: RecordMetadata,
}

impl StoredRecord {
    pub fn new(fields: FlatFields, meta: RecordMetadata) -> Self {
        Self { fields, meta }
    }

    /// The record's own `id` field, when present and a string.
    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    /// Creation time read from `metadata.time.insert`, as an epoch stamp.
    pub fn insert_time(&self) -> Option<Stamp> {
        self.fields.get("metadata.time.insert").and_then(Value::as_stamp)
    }
}

/// Storage operations the tracker depends on.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load one record by its primary id.
    async fn load_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>>;

    /// Load records whose primary id or alias id list intersects `ids`,
    /// sorted by creation time ascending with unstamped records last.
    async fn load_by_ids_or_id(
        &self,
        kind: RecordKind,
        ids: &[String],
        limit: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Load records matching field/value pairs. With `match_all` every pair
    /// must hold, otherwise one suffices. List fields match on membership,
    /// the way a search index treats term queries.
    async fn load_by_field_values(
        &self,
        kind: RecordKind,
        pairs: &[(String, Value)],
        match_all: bool,
        limit: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Insert or replace a record, keyed by its `id` field.
    async fn upsert(&self, kind: RecordKind, record: StoredRecord) -> Result<()>;

    /// Delete by primary id. Deleting an absent record is not an error.
    async fn delete_by_id(&self, kind: RecordKind, id: &str) -> Result<()>;

    /// Rewrite `field` to `to` on every record where it equals `from`.
    /// Returns the number of records touched.
    async fn update_by_query(
        &self,
        kind: RecordKind,
        field: &str,
        from: &Value,
        to: &Value,
    ) -> Result<u64>;

    /// Make prior writes visible to queries.
    async fn refresh(&self, kind: RecordKind) -> Result<()>;
}

/// In-memory [`RecordStore`] for tests and single-process setups.
///
/// Writes are immediately visible, so [`RecordStore::refresh`] is a no-op.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<(RecordKind, String), StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held for one kind.
    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.iter().filter(|e| e.key().0 == kind).count()
    }

    fn collect<F>(&self, kind: RecordKind, limit: usize, matches: F) -> Vec<StoredRecord>
    where
        F: Fn(&StoredRecord) -> bool,
    {
        let mut hits: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|e| e.key().0 == kind && matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        sort_by_insert_time(&mut hits);
        hits.truncate(limit);
        hits
    }
}

/// Oldest first; records without a creation stamp sort last, ties break on
/// id so query results are stable.
pub(crate) fn sort_by_insert_time(records: &mut [StoredRecord]) {
    records.sort_by(|a, b| {
        let at = a.insert_time().unwrap_or(f64::INFINITY);
        let bt = b.insert_time().unwrap_or(f64::INFINITY);
        at.total_cmp(&bt).then_with(|| a.meta.id.cmp(&b.meta.id))
    });
}

fn field_matches(record: &StoredRecord, path: &str, value: &Value) -> bool {
    match record.fields.get(path) {
        Some(stored) if stored == value => true,
        Some(Value::List(items)) => items.contains(value),
        _ => false,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .records
            .get(&(kind, id.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn load_by_ids_or_id(
        &self,
        kind: RecordKind,
        ids: &[String],
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.collect(kind, limit, |record| {
            if record.id().is_some_and(|id| ids.iter().any(|i| i == id)) {
                return true;
            }
            record
                .fields
                .get("ids")
                .and_then(Value::as_list)
                .is_some_and(|aliases| {
                    aliases
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|alias| ids.iter().any(|i| i == alias))
                })
        }))
    }

    async fn load_by_field_values(
        &self,
        kind: RecordKind,
        pairs: &[(String, Value)],
        match_all: bool,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.collect(kind, limit, |record| {
            if match_all {
                pairs.iter().all(|(path, value)| field_matches(record, path, value))
            } else {
                pairs.iter().any(|(path, value)| field_matches(record, path, value))
            }
        }))
    }

    async fn upsert(&self, kind: RecordKind, record: StoredRecord) -> Result<()> {
        let id = record
            .id()
            .ok_or_else(|| Error::MalformedRecord(format!("{} record without id", kind.as_str())))?
            .to_string();
        self.records.insert((kind, id), record);
        Ok(())
    }

    async fn delete_by_id(&self, kind: RecordKind, id: &str) -> Result<()> {
        self.records.remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn update_by_query(
        &self,
        kind: RecordKind,
        field: &str,
        from: &Value,
        to: &Value,
    ) -> Result<u64> {
        let mut touched = 0;
        for mut entry in self.records.iter_mut() {
            if entry.key().0 != kind {
                continue;
            }
            if entry.value().fields.get(field) == Some(from) {
                entry.value_mut().fields.insert(field, to.clone());
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn refresh(&self, _kind: RecordKind) -> Result<()> {
        Ok(())
    }
}
