//! # Merge Engine
//!
//! Field-level merging of duplicate profiles. The engine unions the leaf
//! fields of all duplicates, resolves each to a policy, extracts one
//! candidate per duplicate and reduces the candidates with the first
//! qualifying strategy. Nested policies recurse with the catalog re-scoped
//! at the container path, so a free-form subtree merges leaf by leaf while
//! its audit entries keep full dotted paths.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::clock::{Clock, Stamp};
use crate::error::{Error, Result};
use crate::fields::{is_under, FlatFields, FIELD_LOG_PREFIX};
use crate::model::{FieldStamp, ProfileId};
use crate::policy::{FieldPolicy, PolicyIndex};
use crate::strategy::{strategy_by_id, ValueStamp, DEFAULT_STRATEGIES};
use crate::value::Value;

/// Record-level times plus the per-field audit stamps of one duplicate.
struct ProfileTimes {
    insert: Option<Stamp>,
    update: Option<Stamp>,
    field_stamps: BTreeMap<String, Stamp>,
}

impl ProfileTimes {
    fn of(fields: &FlatFields) -> Self {
        let mut field_stamps = BTreeMap::new();
        for (path, value) in fields.prefixed(FIELD_LOG_PREFIX) {
            let stamp = value
                .as_list()
                .and_then(|items| items.first())
                .and_then(Value::as_stamp);
            if let Some(stamp) = stamp {
                field_stamps.insert(path.to_string(), stamp);
            }
        }
        Self {
            insert: fields.get("metadata.time.insert").and_then(Value::as_stamp),
            update: fields.get("metadata.time.update").and_then(Value::as_stamp),
            field_stamps,
        }
    }
}

/// One field scheduled for merging: its resolved policy and one candidate
/// per duplicate, in duplicate order.
struct FieldMetaData {
    policy: FieldPolicy,
    field: String,
    values: Vec<ValueStamp>,
}

/// What one field merged to.
struct MergedValue {
    value: Value,
    #[allow(dead_code)]
    stamp: Option<Stamp>,
    changed: Option<BTreeMap<String, FieldStamp>>,
}

/// Result of merging a set of duplicates into one field map.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The merged flat fields. Audit entries are not carried over; the
    /// caller folds `changed` into the audit map itself.
    pub fields: FlatFields,
    /// Full-path change stamps for every merged field.
    pub changed: BTreeMap<String, FieldStamp>,
}

pub struct MergeEngine<'a> {
    policies: &'a PolicyIndex,
    clock: &'a dyn Clock,
}

impl<'a> MergeEngine<'a> {
    pub fn new(policies: &'a PolicyIndex, clock: &'a dyn Clock) -> Self {
        Self { policies, clock }
    }

    /// Merge duplicate profiles, given earliest-inserted first.
    pub fn merge(&self, duplicates: &[FlatFields]) -> Result<MergeOutcome> {
        if duplicates.is_empty() {
            return Err(Error::invariant("merge requires at least one profile"));
        }
        let ids = duplicates
            .iter()
            .map(|fields| {
                fields
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ProfileId::from)
                    .ok_or_else(|| Error::MalformedRecord("profile record without id".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let times: Vec<ProfileTimes> = duplicates.iter().map(ProfileTimes::of).collect();
        self.merge_level(duplicates, &ids, &times, "", &[])
    }

    fn merge_level(
        &self,
        profiles: &[FlatFields],
        ids: &[ProfileId],
        times: &[ProfileTimes],
        path: &str,
        skip: &[&str],
    ) -> Result<MergeOutcome> {
        let scoped = self.policies.scoped(path);

        let mut fields_to_merge: Vec<FieldMetaData> = Vec::new();
        for field in union_fields(profiles, skip) {
            let policy = scoped.resolve(&field, &DEFAULT_STRATEGIES);
            // Every leaf under a nested container resolves to the same
            // policy; merge the container once.
            if fields_to_merge.iter().any(|fm| fm.policy == policy) {
                continue;
            }
            let property = policy.property.clone();
            let values = profiles
                .iter()
                .zip(times)
                .zip(ids)
                .map(|((profile, time), id)| ValueStamp {
                    profile: id.clone(),
                    value: profile.subtree(&property).unwrap_or(Value::Null),
                    stamp: time.field_stamps.get(&property).copied(),
                    profile_insert: time.insert,
                    profile_update: time.update,
                })
                .collect();
            fields_to_merge.push(FieldMetaData {
                policy,
                field: property,
                values,
            });
        }

        let now = self.clock.now();
        let mut merged = FlatFields::new();
        let mut changed: BTreeMap<String, FieldStamp> = BTreeMap::new();

        for fm in &fields_to_merge {
            let result = self.merge_field(fm, times)?;
            match result.changed {
                Some(map) if !map.is_empty() => changed.extend(map),
                _ => {
                    changed.insert(fm.field.clone(), FieldStamp::new(now, "merge"));
                }
            }
            write_nested(&mut merged, &fm.field, result.value);
        }

        Ok(MergeOutcome {
            fields: merged,
            changed,
        })
    }

    fn merge_field(&self, fm: &FieldMetaData, times: &[ProfileTimes]) -> Result<MergedValue> {
        let own: Vec<&str> = fm.policy.merge_strategies.iter().map(String::as_str).collect();
        match self.run_strategies(fm, &own, times) {
            Err(Error::UnmergeableField { .. }) => {
                debug!(field = %fm.field, "no configured strategy qualified, trying defaults");
                self.run_strategies(fm, &DEFAULT_STRATEGIES, times)
            }
            other => other,
        }
    }

    fn run_strategies(
        &self,
        fm: &FieldMetaData,
        strategy_ids: &[&str],
        times: &[ProfileTimes],
    ) -> Result<MergedValue> {
        for id in strategy_ids {
            let strategy = match strategy_by_id(id) {
                Some(strategy) => strategy,
                None => {
                    warn!(strategy = id, field = %fm.field, "unknown merge strategy, skipping");
                    continue;
                }
            };
            if fm.policy.nested {
                if !nested_prerequisites(&fm.values) {
                    continue;
                }
                let (value, changed) = self.merge_nested(fm, times)?;
                return Ok(MergedValue {
                    value,
                    stamp: None,
                    changed: Some(changed),
                });
            }
            if !strategy.prerequisites(&fm.values) {
                continue;
            }
            let (value, stamp) = strategy.merge(&fm.values);
            return Ok(MergedValue {
                value,
                stamp,
                changed: None,
            });
        }
        Err(Error::UnmergeableField {
            field: fm.field.clone(),
            values: fm
                .values
                .iter()
                .map(|v| match v.stamp {
                    Some(stamp) => format!("{} (stamp {stamp})", v.value),
                    None => v.value.to_string(),
                })
                .collect(),
        })
    }

    /// Recurse into a nested container. Each candidate becomes a one-field
    /// sub-profile carrying its parent's id; record-level times stay those
    /// of the parents, and the audit stamps keep full dotted paths, so the
    /// parent-level times are passed down unchanged.
    fn merge_nested(
        &self,
        fm: &FieldMetaData,
        times: &[ProfileTimes],
    ) -> Result<(Value, BTreeMap<String, FieldStamp>)> {
        let mut sub_profiles = Vec::with_capacity(fm.values.len());
        let mut sub_ids = Vec::with_capacity(fm.values.len());
        for candidate in &fm.values {
            let mut sub = FlatFields::new();
            sub.insert("id", candidate.profile.as_str());
            if let Some(map) = candidate.value.as_map() {
                if !map.is_empty() {
                    write_nested(&mut sub, &fm.field, candidate.value.clone());
                }
            }
            sub_profiles.push(sub);
            sub_ids.push(candidate.profile.clone());
        }

        let outcome = self.merge_level(&sub_profiles, &sub_ids, times, &fm.field, &["id"])?;
        let value = outcome
            .fields
            .subtree(&fm.field)
            .unwrap_or(Value::Map(BTreeMap::new()));
        Ok((value, outcome.changed))
    }
}

/// Sorted union of the leaf paths of all profiles, minus the audit subtree
/// and the exact paths in `skip`.
fn union_fields(profiles: &[FlatFields], skip: &[&str]) -> Vec<String> {
    let mut union = BTreeSet::new();
    for profile in profiles {
        for path in profile.paths() {
            if is_under(path, FIELD_LOG_PREFIX) {
                continue;
            }
            if skip.contains(&path.as_str()) {
                continue;
            }
            union.insert(path.clone());
        }
    }
    union.into_iter().collect()
}

/// Every candidate is null or a map; an all-null container merges to an
/// empty map.
fn nested_prerequisites(values: &[ValueStamp]) -> bool {
    values
        .iter()
        .all(|v| v.value.is_null() || v.value.as_map().is_some())
}

/// Store a merged value, flattening non-empty maps into leaf entries.
fn write_nested(out: &mut FlatFields, path: &str, value: Value) {
    match value {
        Value::Map(map) if !map.is_empty() => {
            for (key, child) in map {
                write_nested(out, &format!("{path}.{key}"), child);
            }
        }
        other => out.insert(path, other),
    }
}
