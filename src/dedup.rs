//! # Deduplication
//!
//! Collapses every stored record answering for one visitor into a single
//! canonical profile. Discovery fans out over the seed's id set and its
//! flagged merge-key values; the merge engine folds the duplicates field
//! by field; storage is then rewritten so the survivor is the only record
//! left and every event and session points at it.
//!
//! The pipeline is idempotent. Replaying it over an already collapsed
//! profile discovers a single record and changes nothing, and a crash
//! between its storage writes is healed by the next run.

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::fields::FlatFields;
use crate::merge::MergeEngine;
use crate::model::{Profile, ProfileId, RecordMetadata};
use crate::policy::PolicyIndex;
use crate::store::{sort_by_insert_time, RecordKind, RecordStore, StoredRecord};
use crate::value::Value;

/// Result of one deduplication run.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// The canonical profile after the merge.
    pub profile: Profile,
    /// Superseded canonical ids whose records were deleted. Callers use
    /// this to invalidate caches.
    pub deleted: Vec<ProfileId>,
}

/// Runs the duplicate-collapse pipeline against a record store.
pub struct Deduplicator<'a> {
    store: &'a dyn RecordStore,
    clock: &'a dyn Clock,
    policies: &'a PolicyIndex,
    limit: usize,
}

impl<'a> Deduplicator<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        clock: &'a dyn Clock,
        policies: &'a PolicyIndex,
        limit: usize,
    ) -> Self {
        Self {
            store,
            clock,
            policies,
            limit,
        }
    }

    /// Collapse all duplicates of `seed` into one canonical record.
    ///
    /// The seed must already be persisted; discovery and merging read the
    /// store, not the seed's in-memory fields.
    pub async fn deduplicate(&self, seed: &Profile) -> Result<DedupOutcome> {
        let mut records = self.discover(seed).await?;
        match records.len() {
            0 => Err(Error::AlreadyMerged(seed.id.clone())),
            1 => self.absorb_single(records.remove(0)).await,
            _ => self.collapse(records).await,
        }
    }

    /// Every stored profile answering for the seed: by canonical or alias
    /// id, and by equality on all flagged merge-key values. Oldest first.
    async fn discover(&self, seed: &Profile) -> Result<Vec<StoredRecord>> {
        let mut ids: Vec<String> = vec![seed.id.as_str().to_string()];
        for alias in &seed.ids {
            if !alias.is_blank() {
                ids.push(alias.as_str().to_string());
            }
        }

        let mut records = self
            .store
            .load_by_ids_or_id(RecordKind::Profile, &ids, self.limit)
            .await?;

        let pairs = merge_key_values(seed);
        if !pairs.is_empty() {
            let by_keys = self
                .store
                .load_by_field_values(RecordKind::Profile, &pairs, true, self.limit)
                .await?;
            records.extend(by_keys);
        }

        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut unique = Vec::with_capacity(records.len());
        for record in records {
            let Some(id) = record.id().map(str::to_string) else {
                warn!("discovered a profile record without an id, skipping it");
                continue;
            };
            if seen.insert(id) {
                unique.push(record);
            }
        }
        sort_by_insert_time(&mut unique);
        Ok(unique)
    }

    /// One record on file, nothing to collapse. Pending merge bookkeeping
    /// is cleared so the pipeline does not re-trigger.
    async fn absorb_single(&self, record: StoredRecord) -> Result<DedupOutcome> {
        let meta = record.meta.clone();
        let mut profile = Profile::from_fields(&record.fields)?;
        if profile.needs_merging() {
            profile.metadata.system.clear_merge_pending();
            profile.op.mark_updated();
            self.store
                .upsert(
                    RecordKind::Profile,
                    StoredRecord::new(profile.flatten(), meta),
                )
                .await?;
            self.store.refresh(RecordKind::Profile).await?;
        }
        Ok(DedupOutcome {
            profile,
            deleted: Vec::new(),
        })
    }

    async fn collapse(&self, records: Vec<StoredRecord>) -> Result<DedupOutcome> {
        let duplicates: Vec<FlatFields> = records.iter().map(|r| r.fields.clone()).collect();
        let outcome = MergeEngine::new(self.policies, self.clock).merge(&duplicates)?;

        let mut merged = Profile::from_fields(&outcome.fields)?;
        for (path, stamp) in outcome.changed {
            merged.set_field_stamp(path, stamp);
        }
        merged.mark_merged(self.clock.now());

        // Canonical id hygiene: the survivor never aliases itself, and
        // every collapsed record's id must keep resolving to the survivor.
        merged.ids.retain(|id| *id != merged.id);
        let mut superseded: Vec<ProfileId> = Vec::new();
        for record in &records {
            if let Some(id) = record.id() {
                if id != merged.id.as_str() {
                    let id = ProfileId::from(id);
                    merged.add_alias(id.clone());
                    superseded.push(id);
                }
            }
        }

        debug!(
            profile_id = %merged.id,
            collapsed = records.len(),
            "collapsing duplicate profiles"
        );

        // The merged result overwrites the survivor's storage slot.
        let survivor_meta = records
            .iter()
            .find(|r| r.id() == Some(merged.id.as_str()))
            .map(|r| r.meta.clone())
            .unwrap_or_else(|| RecordMetadata::new(merged.id.as_str()));
        self.store
            .upsert(
                RecordKind::Profile,
                StoredRecord::new(merged.flatten(), survivor_meta),
            )
            .await?;
        self.store.refresh(RecordKind::Profile).await?;

        // Events and sessions follow their profile to its new id.
        let to = Value::from(merged.id.as_str());
        for old in &superseded {
            let from = Value::from(old.as_str());
            self.store
                .update_by_query(RecordKind::Event, "profile.id", &from, &to)
                .await?;
            self.store.refresh(RecordKind::Event).await?;
            self.store
                .update_by_query(RecordKind::Session, "profile.id", &from, &to)
                .await?;
            self.store.refresh(RecordKind::Session).await?;
        }

        for old in &superseded {
            self.store
                .delete_by_id(RecordKind::Profile, old.as_str())
                .await?;
        }
        self.store.refresh(RecordKind::Profile).await?;

        Ok(DedupOutcome {
            profile: merged,
            deleted: superseded,
        })
    }
}

/// The discovery pairs for a profile's flagged merge keys. Keys whose
/// value is absent or empty cannot identify anyone and are dropped.
fn merge_key_values(profile: &Profile) -> Vec<(String, Value)> {
    profile
        .metadata
        .system
        .merge_keys
        .iter()
        .filter_map(|path| {
            profile
                .attributes
                .get(path)
                .filter(|value| !value.is_empty())
                .map(|value| (path.clone(), value.clone()))
        })
        .collect()
}
