//! # Data Model
//!
//! Profiles, sessions and the identifiers that bind them. A profile is the
//! canonical record for one real visitor; sessions are visit contexts owned
//! by exactly one profile via a weak id reference. Both types convert to and
//! from the flat dotted-path form the store and the merge engine work on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Stamp;
use crate::error::{Error, Result};
use crate::fields::{FlatFields, FIELD_LOG_PREFIX};
use crate::value::Value;

/// Sessions minted to shield an ambiguous original session carry this
/// prefix on their deterministic id.
pub const SHADOW_SESSION_PREFIX: &str = "shd-";

/// Canonical or historical profile identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub String);

impl ProfileId {
    /// Freshly minted random id for a never-seen visitor.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProfileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Deterministic id of the shadow session protecting this one.
    pub fn shadow(&self) -> SessionId {
        SessionId(format!("{SHADOW_SESSION_PREFIX}{}", self.0))
    }

    pub fn is_shadow(&self) -> bool {
        self.0.starts_with(SHADOW_SESSION_PREFIX)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Profile reference carried by payloads and sessions. Payload refs may
/// carry extra alternate ids to be unioned into the resolved profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: ProfileId,
    #[serde(default)]
    pub ids: Vec<ProfileId>,
}

impl ProfileRef {
    pub fn new(id: impl Into<ProfileId>) -> Self {
        Self {
            id: id.into(),
            ids: Vec::new(),
        }
    }
}

/// Session reference carried by payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: SessionId,
}

impl SessionRef {
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self { id: id.into() }
    }
}

/// Record lifecycle timestamps, epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeMetadata {
    pub insert: Option<Stamp>,
    pub update: Option<Stamp>,
}

impl TimeMetadata {
    pub fn at(now: Stamp) -> Self {
        Self {
            insert: Some(now),
            update: Some(now),
        }
    }
}

/// One `metadata.fields` audit entry: last-change stamp plus the actor
/// token that made the change. Serialized as a `[stamp, actor]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStamp(pub Stamp, pub String);

impl FieldStamp {
    pub fn new(stamp: Stamp, actor: impl Into<String>) -> Self {
        Self(stamp, actor.into())
    }

    pub fn stamp(&self) -> Stamp {
        self.0
    }

    pub fn actor(&self) -> &str {
        &self.1
    }
}

/// Merge bookkeeping. A profile with recorded merge keys is waiting for the
/// deduplication pipeline to collapse its duplicate set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetadata {
    #[serde(default)]
    pub merge_keys: Vec<String>,
}

impl SystemMetadata {
    pub fn has_merge_pending(&self) -> bool {
        !self.merge_keys.is_empty()
    }

    pub fn flag_merge_key(&mut self, field: impl Into<String>) {
        let field = field.into();
        if !self.merge_keys.contains(&field) {
            self.merge_keys.push(field);
        }
    }

    pub fn clear_merge_pending(&mut self) {
        self.merge_keys.clear();
    }
}

/// Profile metadata: lifecycle times, the per-field audit map, merge
/// bookkeeping and free-form auxiliary data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub time: TimeMetadata,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldStamp>,
    #[serde(default)]
    pub system: SystemMetadata,
    #[serde(default)]
    pub aux: BTreeMap<String, Value>,
}

/// Transient mutation flags. Derived during resolution and merging, never
/// persisted verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operation {
    pub new: bool,
    pub update: bool,
}

impl Operation {
    pub fn mark_new(&mut self) {
        self.new = true;
        self.update = true;
    }

    pub fn mark_updated(&mut self) {
        self.update = true;
    }
}

/// Canonical visitor record.
///
/// `id` is never a member of `ids` in steady state; an id moves into `ids`
/// only when another id supersedes it during deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    #[serde(default)]
    pub ids: Vec<ProfileId>,
    #[serde(default)]
    pub attributes: FlatFields,
    #[serde(default)]
    pub metadata: ProfileMetadata,
    #[serde(skip)]
    pub op: Operation,
}

impl Profile {
    /// Brand-new profile, flagged new and updated so the host persists it.
    pub fn new(id: ProfileId, now: Stamp) -> Self {
        let mut op = Operation::default();
        op.mark_new();
        Self {
            id,
            ids: Vec::new(),
            attributes: FlatFields::new(),
            metadata: ProfileMetadata {
                time: TimeMetadata::at(now),
                ..ProfileMetadata::default()
            },
            op,
        }
    }

    pub fn has_alias(&self, id: &ProfileId) -> bool {
        self.ids.contains(id)
    }

    /// True when this profile may legitimately answer a lookup for
    /// `requested`: either its canonical id or one of its alternates.
    pub fn answers_for(&self, requested: &ProfileId) -> bool {
        self.id == *requested || self.has_alias(requested)
    }

    /// Union in an alternate id. The canonical id is never aliased to
    /// itself. Returns whether anything was added.
    pub fn add_alias(&mut self, id: ProfileId) -> bool {
        if id == self.id || self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn needs_merging(&self) -> bool {
        self.metadata.system.has_merge_pending()
    }

    /// Record an audit stamp for one field path.
    pub fn set_field_stamp(&mut self, path: impl Into<String>, stamp: FieldStamp) {
        self.metadata.fields.insert(path.into(), stamp);
    }

    /// Clear merge bookkeeping and stamp the merge instant.
    pub fn mark_merged(&mut self, now: Stamp) {
        self.metadata.system.clear_merge_pending();
        self.metadata
            .aux
            .insert("merge_time".to_string(), Value::Float(now));
        self.metadata.time.update = Some(now);
        self.op.mark_updated();
    }

    /// Flatten into the dotted-path form used by the store and the merge
    /// engine. Audit entries land under `metadata.fields.<path>`.
    pub fn flatten(&self) -> FlatFields {
        let mut out = FlatFields::new();
        out.insert("id", self.id.as_str());
        out.insert(
            "ids",
            Value::List(self.ids.iter().map(|i| Value::from(i.as_str())).collect()),
        );
        if let Some(insert) = self.metadata.time.insert {
            out.insert("metadata.time.insert", insert);
        }
        if let Some(update) = self.metadata.time.update {
            out.insert("metadata.time.update", update);
        }
        if self.metadata.system.has_merge_pending() {
            out.insert(
                "metadata.system.merge_keys",
                Value::List(
                    self.metadata
                        .system
                        .merge_keys
                        .iter()
                        .map(|k| Value::from(k.as_str()))
                        .collect(),
                ),
            );
        }
        for (key, value) in &self.metadata.aux {
            out.insert(format!("metadata.aux.{key}"), value.clone());
        }
        for (path, stamp) in &self.metadata.fields {
            out.insert(
                format!("{FIELD_LOG_PREFIX}.{path}"),
                Value::List(vec![Value::Float(stamp.stamp()), Value::from(stamp.actor())]),
            );
        }
        for (path, value) in self.attributes.iter() {
            out.insert(path.clone(), value.clone());
        }
        out
    }

    /// Rebuild from the flat form. Unknown paths are preserved as
    /// attributes; a record without an id is malformed.
    pub fn from_fields(fields: &FlatFields) -> Result<Self> {
        let id = match fields.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => ProfileId::from(id),
            _ => return Err(Error::MalformedRecord("profile record has no id".into())),
        };
        let mut profile = Profile {
            id,
            ids: Vec::new(),
            attributes: FlatFields::new(),
            metadata: ProfileMetadata::default(),
            op: Operation::default(),
        };
        for (path, value) in fields.iter() {
            match path.as_str() {
                "id" => {}
                "ids" => {
                    if let Some(items) = value.as_list() {
                        profile.ids = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(ProfileId::from)
                            .collect();
                    }
                }
                "metadata.time.insert" => profile.metadata.time.insert = value.as_stamp(),
                "metadata.time.update" => profile.metadata.time.update = value.as_stamp(),
                "metadata.system.merge_keys" => {
                    if let Some(items) = value.as_list() {
                        profile.metadata.system.merge_keys = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                    }
                }
                path if path.starts_with("metadata.aux.") => {
                    let key = path.trim_start_matches("metadata.aux.");
                    profile.metadata.aux.insert(key.to_string(), value.clone());
                }
                path if path.starts_with(FIELD_LOG_PREFIX) => {
                    if let Some(suffix) = path
                        .strip_prefix(FIELD_LOG_PREFIX)
                        .and_then(|rest| rest.strip_prefix('.'))
                    {
                        if let Some(stamp) = parse_field_stamp(value) {
                            profile.metadata.fields.insert(suffix.to_string(), stamp);
                        }
                    }
                }
                _ => profile.attributes.insert(path.clone(), value.clone()),
            }
        }
        Ok(profile)
    }
}

fn parse_field_stamp(value: &Value) -> Option<FieldStamp> {
    let items = value.as_list()?;
    let stamp = items.first()?.as_stamp()?;
    let actor = items
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(FieldStamp(stamp, actor))
}

/// Session metadata; only lifecycle times are tracked here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub time: TimeMetadata,
}

/// One visit context, owned by a profile via `profile.id`.
///
/// A loaded session without a profile pointer is corrupted; the resolution
/// pipeline discards and replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub profile: Option<ProfileRef>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub context: FlatFields,
    #[serde(default)]
    pub properties: FlatFields,
    #[serde(skip)]
    pub op: Operation,
}

impl Session {
    /// Brand-new session, flagged new and updated.
    pub fn new(id: SessionId, now: Stamp) -> Self {
        let mut op = Operation::default();
        op.mark_new();
        Self {
            id,
            profile: None,
            metadata: SessionMetadata {
                time: TimeMetadata::at(now),
            },
            context: FlatFields::new(),
            properties: FlatFields::new(),
            op,
        }
    }

    pub fn has_profile_pointer(&self) -> bool {
        self.profile
            .as_ref()
            .map(|p| !p.id.is_blank())
            .unwrap_or(false)
    }

    pub fn profile_id(&self) -> Option<&ProfileId> {
        self.profile.as_ref().map(|p| &p.id).filter(|id| !id.is_blank())
    }

    /// Point this session at a profile, marking the session updated.
    pub fn point_at(&mut self, id: ProfileId) {
        self.profile = Some(ProfileRef::new(id));
        self.op.mark_updated();
    }

    pub fn flatten(&self) -> FlatFields {
        let mut out = FlatFields::new();
        out.insert("id", self.id.as_str());
        if let Some(profile_id) = self.profile_id() {
            out.insert("profile.id", profile_id.as_str());
        }
        if let Some(insert) = self.metadata.time.insert {
            out.insert("metadata.time.insert", insert);
        }
        if let Some(update) = self.metadata.time.update {
            out.insert("metadata.time.update", update);
        }
        for (path, value) in self.context.iter() {
            out.insert(format!("context.{path}"), value.clone());
        }
        for (path, value) in self.properties.iter() {
            out.insert(format!("properties.{path}"), value.clone());
        }
        out
    }

    pub fn from_fields(fields: &FlatFields) -> Result<Self> {
        let id = match fields.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => SessionId::from(id),
            _ => return Err(Error::MalformedRecord("session record has no id".into())),
        };
        let mut session = Session {
            id,
            profile: None,
            metadata: SessionMetadata::default(),
            context: FlatFields::new(),
            properties: FlatFields::new(),
            op: Operation::default(),
        };
        for (path, value) in fields.iter() {
            match path.as_str() {
                "id" => {}
                "profile.id" => {
                    if let Some(profile_id) = value.as_str().filter(|s| !s.is_empty()) {
                        session.profile = Some(ProfileRef::new(profile_id));
                    }
                }
                "metadata.time.insert" => session.metadata.time.insert = value.as_stamp(),
                "metadata.time.update" => session.metadata.time.update = value.as_stamp(),
                path if path.starts_with("context.") => {
                    session
                        .context
                        .insert(path.trim_start_matches("context.").to_string(), value.clone());
                }
                path if path.starts_with("properties.") => {
                    session.properties.insert(
                        path.trim_start_matches("properties.").to_string(),
                        value.clone(),
                    );
                }
                _ => {}
            }
        }
        Ok(session)
    }
}

/// Storage identity of a loaded record: which physical slot to overwrite
/// when persisting a merged result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: String,
    pub index: Option<String>,
}

impl RecordMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index: None,
        }
    }

    pub fn in_index(id: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index: Some(index.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_ids_are_deterministic() {
        let id = SessionId::from("s-1");
        assert_eq!(id.shadow().as_str(), "shd-s-1");
        assert!(id.shadow().is_shadow());
        assert!(!id.is_shadow());
    }

    #[test]
    fn alias_membership() {
        let mut profile = Profile::new(ProfileId::from("x1"), 10.0);
        assert!(profile.add_alias(ProfileId::from("p1")));
        assert!(!profile.add_alias(ProfileId::from("p1")));
        assert!(!profile.add_alias(ProfileId::from("x1")));

        assert!(profile.answers_for(&ProfileId::from("x1")));
        assert!(profile.answers_for(&ProfileId::from("p1")));
        assert!(!profile.answers_for(&ProfileId::from("zz")));
        assert_eq!(profile.ids, vec![ProfileId::from("p1")]);
    }

    #[test]
    fn new_profile_is_flagged() {
        let profile = Profile::new(ProfileId::random(), 10.0);
        assert!(profile.op.new);
        assert!(profile.op.update);
        assert_eq!(profile.metadata.time.insert, Some(10.0));
    }

    #[test]
    fn merge_bookkeeping() {
        let mut profile = Profile::new(ProfileId::from("p"), 1.0);
        profile.metadata.system.flag_merge_key("traits.email");
        profile.metadata.system.flag_merge_key("traits.email");
        assert!(profile.needs_merging());
        assert_eq!(profile.metadata.system.merge_keys.len(), 1);

        profile.mark_merged(99.0);
        assert!(!profile.needs_merging());
        assert_eq!(profile.metadata.aux["merge_time"], Value::Float(99.0));
        assert_eq!(profile.metadata.time.update, Some(99.0));
    }

    #[test]
    fn profile_flat_round_trip() {
        let mut profile = Profile::new(ProfileId::from("x1"), 10.0);
        profile.add_alias(ProfileId::from("p1"));
        profile.attributes.insert("traits.email", "a@x.io");
        profile.attributes.insert("stats.visits", 3i64);
        profile.metadata.system.flag_merge_key("traits.email");
        profile.set_field_stamp("traits.email", FieldStamp::new(9.5, "e-1"));

        let flat = profile.flatten();
        assert_eq!(flat.get("id"), Some(&Value::from("x1")));
        assert_eq!(
            flat.get("metadata.fields.traits.email"),
            Some(&Value::List(vec![Value::Float(9.5), Value::from("e-1")]))
        );

        let back = Profile::from_fields(&flat).unwrap();
        assert_eq!(back.id, profile.id);
        assert_eq!(back.ids, profile.ids);
        assert_eq!(back.attributes, profile.attributes);
        assert_eq!(back.metadata, profile.metadata);
        assert!(!back.op.new);
    }

    #[test]
    fn session_flat_round_trip() {
        let mut session = Session::new(SessionId::from("s1"), 5.0);
        session.point_at(ProfileId::from("p1"));
        session.context.insert("browser", "firefox");
        session.properties.insert("depth", 2i64);

        let flat = session.flatten();
        assert_eq!(flat.get("profile.id"), Some(&Value::from("p1")));

        let back = Session::from_fields(&flat).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.profile_id(), Some(&ProfileId::from("p1")));
        assert_eq!(back.context.get("browser"), Some(&Value::from("firefox")));
        assert_eq!(back.properties.get("depth"), Some(&Value::from(2i64)));
    }

    #[test]
    fn malformed_records_are_rejected() {
        let fields = FlatFields::new();
        assert!(Profile::from_fields(&fields).is_err());
        assert!(Session::from_fields(&fields).is_err());
    }
}
