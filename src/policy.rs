//! # Field Policies
//!
//! Per-field merge configuration. A policy names the strategies tried for
//! one dotted field path; the index resolves every observed field to a
//! policy, falling back to a nested parent or a synthesized default so the
//! merge engine never meets an unconfigured field.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::strategy::{
    AND, FIRST_DATETIME, FIRST_ITEM, FIRST_UPDATE, LAST_DATETIME, LAST_UPDATE, SUM, UNIQUE_CONCAT,
};
use crate::value::Value;

/// Merge policy for one field path.
///
/// `path` scopes the policy ("" for top-level fields, the parent path for
/// policies that apply inside a nested merge); `property` is the field path
/// the policy governs. Two policies are the same policy iff `(path,
/// property)` match, regardless of configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPolicy {
    pub entity: String,
    pub path: String,
    pub property: String,
    pub field_type: String,
    pub merge_strategies: Vec<String>,
    pub nested: bool,
    pub optional: bool,
    pub default: Option<Value>,
}

impl FieldPolicy {
    /// Top-level profile policy with the given strategy chain.
    pub fn profile(property: impl Into<String>, field_type: impl Into<String>, strategies: &[&str]) -> Self {
        Self {
            entity: "profile".to_string(),
            path: String::new(),
            property: property.into(),
            field_type: field_type.into(),
            merge_strategies: strategies.iter().map(|s| s.to_string()).collect(),
            nested: false,
            optional: false,
            default: None,
        }
    }

    /// Policy synthesized for a field absent from the catalog.
    pub fn synthesized(path: &str, property: &str, default_strategies: &[&str]) -> Self {
        Self {
            entity: "profile".to_string(),
            path: path.to_string(),
            property: property.to_string(),
            field_type: "unknown".to_string(),
            merge_strategies: default_strategies.iter().map(|s| s.to_string()).collect(),
            nested: false,
            optional: false,
            default: None,
        }
    }

    pub fn scoped(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

impl PartialEq for FieldPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.property == other.property
    }
}

impl Eq for FieldPolicy {}

impl std::hash::Hash for FieldPolicy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.property.hash(state);
    }
}

/// Policy catalog plus scoped lookup.
///
/// The merge engine re-scopes the same catalog at every nesting level, the
/// way the audit map re-uses full dotted paths at every level.
#[derive(Debug, Clone)]
pub struct PolicyIndex {
    catalog: Vec<FieldPolicy>,
}

impl PolicyIndex {
    pub fn new(catalog: Vec<FieldPolicy>) -> Self {
        Self { catalog }
    }

    /// The built-in profile catalog.
    pub fn profile_defaults() -> Self {
        default_profile_policies()
    }

    /// Extend the catalog; later entries win a `(path, property)` collision.
    pub fn with_policy(mut self, policy: FieldPolicy) -> Self {
        self.catalog.retain(|p| p != &policy);
        self.catalog.push(policy);
        self
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// View of the catalog scoped to one nesting level.
    pub fn scoped(&self, path: &str) -> ScopedPolicies<'_> {
        let mut by_property = FxHashMap::default();
        let mut nested = Vec::new();
        for policy in self.catalog.iter().filter(|p| p.path == path) {
            by_property.insert(policy.property.as_str(), policy);
            if policy.nested {
                nested.push(policy);
            }
        }
        ScopedPolicies {
            path: path.to_string(),
            by_property,
            nested,
        }
    }
}

impl Default for PolicyIndex {
    fn default() -> Self {
        Self::profile_defaults()
    }
}

/// Catalog entries visible at one scope, indexed by property.
#[derive(Debug)]
pub struct ScopedPolicies<'a> {
    path: String,
    by_property: FxHashMap<&'a str, &'a FieldPolicy>,
    nested: Vec<&'a FieldPolicy>,
}

impl ScopedPolicies<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve a field to its policy: exact catalog hit, enclosing nested
    /// policy, or a synthesized default running `default_strategies`.
    pub fn resolve(&self, field: &str, default_strategies: &[&str]) -> FieldPolicy {
        if let Some(policy) = self.by_property.get(field) {
            return (*policy).clone();
        }
        for policy in &self.nested {
            let prefix = policy.property.as_str();
            if field.starts_with(prefix) && field.as_bytes().get(prefix.len()) == Some(&b'.') {
                return (*policy).clone();
            }
        }
        FieldPolicy::synthesized(&self.path, field, default_strategies)
    }
}

/// Built-in merge policies for profile records.
///
/// Free-form subtrees (`traits`, `interests`, `metadata.aux`) merge by
/// recursion; everything inside them falls back to the default chain unless
/// a scoped policy says otherwise.
pub fn default_profile_policies() -> PolicyIndex {
    PolicyIndex::new(vec![
        FieldPolicy::profile("id", "str", &[FIRST_ITEM]),
        FieldPolicy::profile("ids", "list", &[UNIQUE_CONCAT]),
        FieldPolicy::profile("metadata.time.insert", "datetime", &[FIRST_DATETIME]).optional(),
        FieldPolicy::profile("metadata.time.update", "datetime", &[LAST_DATETIME]).optional(),
        FieldPolicy::profile("metadata.system.merge_keys", "list", &[UNIQUE_CONCAT]).optional(),
        FieldPolicy::profile("metadata.aux", "dict", &[LAST_UPDATE]).nested().optional(),
        FieldPolicy::profile("data.pii.firstname", "str", &[LAST_UPDATE]).optional(),
        FieldPolicy::profile("data.pii.lastname", "str", &[LAST_UPDATE]).optional(),
        FieldPolicy::profile("data.pii.display_name", "str", &[LAST_UPDATE]).optional(),
        FieldPolicy::profile("data.pii.birthday", "datetime", &[LAST_UPDATE, FIRST_DATETIME])
            .optional(),
        FieldPolicy::profile("data.contact.email.main", "str", &[LAST_UPDATE]).optional(),
        FieldPolicy::profile("data.contact.email.business", "str", &[LAST_UPDATE]).optional(),
        FieldPolicy::profile("data.contact.phone.main", "str", &[LAST_UPDATE]).optional(),
        FieldPolicy::profile("data.identifier.id", "str", &[FIRST_UPDATE]).optional(),
        FieldPolicy::profile("data.anonymous", "bool", &[AND]).optional(),
        FieldPolicy::profile("stats.visits", "int", &[SUM]).optional(),
        FieldPolicy::profile("stats.views", "int", &[SUM]).optional(),
        FieldPolicy::profile("segments", "list", &[UNIQUE_CONCAT]).optional(),
        FieldPolicy::profile("consents", "dict", &[LAST_UPDATE]).nested().optional(),
        FieldPolicy::profile("traits", "dict", &[LAST_UPDATE]).nested().optional(),
        FieldPolicy::profile("interests", "dict", &[LAST_UPDATE]).nested().optional(),
    ])
}
