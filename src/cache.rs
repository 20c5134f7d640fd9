//! # Profile Cache
//!
//! Best-effort read cache over resolved profiles. The store stays
//! authoritative: a stale or missing cache entry is corrected by the next
//! load, so implementations never have to be coherent across processes.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::model::{Profile, ProfileId};

/// Cache operations the tracker uses around resolution and deduplication.
pub trait ProfileCache: Send + Sync {
    fn get(&self, id: &ProfileId) -> Option<Profile>;
    fn put(&self, profile: &Profile);
    fn delete(&self, id: &ProfileId);
}

/// In-process LRU cache keyed by canonical profile id.
pub struct MemoryProfileCache {
    inner: Mutex<LruCache<String, Profile>>,
}

impl MemoryProfileCache {
    /// A zero capacity is clamped to one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl ProfileCache for MemoryProfileCache {
    fn get(&self, id: &ProfileId) -> Option<Profile> {
        self.inner.lock().get(id.as_str()).cloned()
    }

    fn put(&self, profile: &Profile) {
        self.inner
            .lock()
            .put(profile.id.as_str().to_string(), profile.clone());
    }

    fn delete(&self, id: &ProfileId) {
        self.inner.lock().pop(id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> Profile {
        Profile::new(ProfileId::from(id), 100.0)
    }

    #[test]
    fn put_get_delete_round_trip() {
        let cache = MemoryProfileCache::new(8);
        let p = profile("p-1");
        cache.put(&p);

        let hit = cache.get(&ProfileId::from("p-1")).unwrap();
        assert_eq!(hit.id, p.id);
        assert!(cache.get(&ProfileId::from("p-2")).is_none());

        cache.delete(&ProfileId::from("p-1"));
        assert!(cache.get(&ProfileId::from("p-1")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = MemoryProfileCache::new(2);
        cache.put(&profile("p-1"));
        cache.put(&profile("p-2"));
        // Touch p-1 so p-2 is the eviction candidate.
        cache.get(&ProfileId::from("p-1"));
        cache.put(&profile("p-3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ProfileId::from("p-1")).is_some());
        assert!(cache.get(&ProfileId::from("p-2")).is_none());
        assert!(cache.get(&ProfileId::from("p-3")).is_some());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = MemoryProfileCache::new(0);
        cache.put(&profile("p-1"));
        assert!(cache.get(&ProfileId::from("p-1")).is_some());
    }
}
