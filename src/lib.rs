//! # Uniprofile
//!
//! An identity-resolution and field-level merge core for visitor tracking.
//!
//! Tracking calls arrive with any combination of profile id, session id and
//! visit context. The tracker resolves them to a consistent profile/session
//! pair, repairs forged or conflicting ids along the way, and collapses
//! duplicate profiles field by field under configurable merge strategies,
//! keeping a per-field audit trail of every change.

pub mod cache;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fields;
pub mod lock;
pub mod merge;
pub mod model;
pub mod policy;
pub mod resolution;
pub mod store;
pub mod strategy;
pub mod value;

// Re-export main types for convenience
pub use cache::{MemoryProfileCache, ProfileCache};
pub use clock::{Clock, FixedClock, Stamp, SystemClock};
pub use config::TrackerConfig;
pub use dedup::{DedupOutcome, Deduplicator};
pub use error::{Error, Result};
pub use fields::{FlatFields, FIELD_LOG_PREFIX};
pub use lock::{LockGuard, MemoryLock, ProfileLock};
pub use merge::{MergeEngine, MergeOutcome};
pub use model::{
    FieldStamp, Profile, ProfileId, ProfileRef, RecordMetadata, Session, SessionId, SessionRef,
    TimeMetadata,
};
pub use policy::{default_profile_policies, FieldPolicy, PolicyIndex};
pub use resolution::{Resolution, Resolver, TrackerPayload};
pub use store::{MemoryStore, RecordKind, RecordStore, StoredRecord};
pub use strategy::{MergeStrategy, ValueStamp, DEFAULT_STRATEGIES};
pub use value::Value;

use std::sync::Arc;

/// Main API for visitor tracking.
///
/// Owns the storage, cache, lock and clock seams and wires one tracking
/// call through resolution, persistence and deduplication.
pub struct Tracker {
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn ProfileCache>,
    lock: Arc<dyn ProfileLock>,
    clock: Arc<dyn Clock>,
    policies: PolicyIndex,
    config: TrackerConfig,
}

impl Tracker {
    /// Tracker over an in-memory store, for tests and single-process use.
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new(), TrackerConfig::default())
    }

    /// Create a tracker with a custom store implementation.
    pub fn with_store<S>(store: S, config: TrackerConfig) -> Self
    where
        S: RecordStore + 'static,
    {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store: Arc::new(store),
            cache: Arc::new(MemoryProfileCache::new(config.cache_capacity)),
            lock: Arc::new(MemoryLock::new(clock.clone())),
            clock,
            policies: default_profile_policies(),
            config,
        }
    }

    /// Replace the profile cache.
    pub fn with_cache<C>(mut self, cache: C) -> Self
    where
        C: ProfileCache + 'static,
    {
        self.cache = Arc::new(cache);
        self
    }

    /// Replace the lock provider.
    pub fn with_lock<L>(mut self, lock: L) -> Self
    where
        L: ProfileLock + 'static,
    {
        self.lock = Arc::new(lock);
        self
    }

    /// Replace the clock used for record and audit timestamps. The lock
    /// provider keeps its own clock; replace it too when TTLs must follow.
    pub fn with_clock<K>(mut self, clock: K) -> Self
    where
        K: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the merge policy catalog.
    pub fn with_policies(mut self, policies: PolicyIndex) -> Self {
        self.policies = policies;
        self
    }

    /// The underlying record store.
    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Resolve a payload into its session and profile, persist what
    /// changed, and collapse duplicates when the profile is flagged for
    /// merging. The payload is rewritten to the resolved ids.
    pub async fn track(&self, payload: &mut TrackerPayload) -> Result<Resolution> {
        let static_ids = self.config.static_profile_id || payload.static_profile_id;

        // One advisory lock spans resolution and any merge it triggers.
        // Cooperating callers key on the id they share; canonical-id drift
        // during resolution is tolerated by the data model.
        let _guard = match payload.profile_id() {
            Some(id) => self.lock.acquire(id.as_str(), self.config.lock_ttl).await?,
            None => LockGuard::unlocked(),
        };

        let resolver = Resolver::new(self.store.as_ref(), self.clock.as_ref());
        let mut resolution = resolver.resolve(payload, static_ids).await?;

        self.persist(&resolution).await?;

        if let Some(profile) = resolution.profile.take() {
            let profile = if profile.needs_merging() {
                let outcome = self.run_dedup(&profile).await?;
                for old in &outcome.deleted {
                    self.cache.delete(old);
                }
                // The session follows the survivor; its stored record was
                // already re-pointed by the collapse.
                if resolution.session.profile_id() != Some(&outcome.profile.id) {
                    resolution.session.profile =
                        Some(ProfileRef::new(outcome.profile.id.clone()));
                }
                outcome.profile
            } else {
                profile
            };
            self.cache.put(&profile);
            resolution.profile = Some(profile);
        }

        Ok(resolution)
    }

    /// Collapse duplicates of a profile outside the tracking flow. Takes
    /// the profile's advisory lock and returns the canonical survivor.
    pub async fn deduplicate(&self, seed: &Profile) -> Result<Profile> {
        let _guard = self
            .lock
            .acquire(seed.id.as_str(), self.config.lock_ttl)
            .await?;
        let outcome = self.run_dedup(seed).await?;
        for old in &outcome.deleted {
            self.cache.delete(old);
        }
        self.cache.put(&outcome.profile);
        Ok(outcome.profile)
    }

    /// Persist a profile mutated by the host application. Logged attribute
    /// changes become `[stamp, actor]` audit entries, which later merges
    /// order by.
    pub async fn save_profile(&self, profile: &mut Profile, actor: &str) -> Result<()> {
        for (path, change) in profile.attributes.take_changes() {
            profile.set_field_stamp(path, FieldStamp::new(change.stamp, actor));
        }
        profile.op.mark_updated();
        let record = StoredRecord::new(
            profile.flatten(),
            RecordMetadata::new(profile.id.as_str()),
        );
        self.store.upsert(RecordKind::Profile, record).await?;
        self.store.refresh(RecordKind::Profile).await?;
        self.cache.put(profile);
        Ok(())
    }

    /// Load a profile by any of its ids, trying the cache first.
    pub async fn profile(&self, id: &ProfileId) -> Result<Option<Profile>> {
        if let Some(hit) = self.cache.get(id) {
            return Ok(Some(hit));
        }
        let ids = vec![id.as_str().to_string()];
        let mut hits = self
            .store
            .load_by_ids_or_id(RecordKind::Profile, &ids, 2)
            .await?;
        if hits.is_empty() {
            return Ok(None);
        }
        let profile = Profile::from_fields(&hits.remove(0).fields)?;
        self.cache.put(&profile);
        Ok(Some(profile))
    }

    /// Load a session by id.
    pub async fn session(&self, id: &SessionId) -> Result<Option<Session>> {
        match self
            .store
            .load_by_id(RecordKind::Session, id.as_str())
            .await?
        {
            Some(record) => Ok(Some(Session::from_fields(&record.fields)?)),
            None => Ok(None),
        }
    }

    async fn persist(&self, resolution: &Resolution) -> Result<()> {
        if let Some(profile) = resolution.profile.as_ref() {
            if profile.op.new || profile.op.update {
                let record = StoredRecord::new(
                    profile.flatten(),
                    RecordMetadata::new(profile.id.as_str()),
                );
                self.store.upsert(RecordKind::Profile, record).await?;
                self.store.refresh(RecordKind::Profile).await?;
            }
        }
        let session = &resolution.session;
        if session.op.new || session.op.update {
            let record =
                StoredRecord::new(session.flatten(), RecordMetadata::new(session.id.as_str()));
            self.store.upsert(RecordKind::Session, record).await?;
            self.store.refresh(RecordKind::Session).await?;
        }
        Ok(())
    }

    async fn run_dedup(&self, seed: &Profile) -> Result<DedupOutcome> {
        Deduplicator::new(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.policies,
            self.config.discovery_limit,
        )
        .deduplicate(seed)
        .await
    }
}
