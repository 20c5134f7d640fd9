use std::sync::Arc;

use uniprofile::{
    FixedClock, MemoryLock, MemoryStore, Profile, ProfileId, RecordKind, RecordMetadata,
    RecordStore, Session, StoredRecord, Tracker, TrackerConfig, Value,
};

/// Tracker over a fresh in-memory store, with a deterministic clock the
/// test keeps a handle to.
#[allow(dead_code)]
pub fn tracker_at(now: f64) -> (Tracker, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(now));
    let tracker = Tracker::with_store(MemoryStore::new(), TrackerConfig::default())
        .with_clock(clock.clone())
        .with_lock(MemoryLock::new(clock.clone()));
    (tracker, clock)
}

#[allow(dead_code)]
pub async fn seed_profile(store: &dyn RecordStore, profile: &Profile) -> anyhow::Result<()> {
    let record = StoredRecord::new(
        profile.flatten(),
        RecordMetadata::new(profile.id.as_str()),
    );
    store.upsert(RecordKind::Profile, record).await?;
    Ok(())
}

#[allow(dead_code)]
pub async fn seed_session(store: &dyn RecordStore, session: &Session) -> anyhow::Result<()> {
    let record = StoredRecord::new(
        session.flatten(),
        RecordMetadata::new(session.id.as_str()),
    );
    store.upsert(RecordKind::Session, record).await?;
    Ok(())
}

/// Profile with lifecycle times and a handful of attributes.
#[allow(dead_code)]
pub fn visitor(id: &str, inserted: f64, attributes: &[(&str, Value)]) -> Profile {
    let mut profile = Profile::new(ProfileId::from(id), inserted);
    for (path, value) in attributes {
        profile.attributes.insert(*path, value.clone());
    }
    profile
}
