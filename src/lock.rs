//! # Profile Lock
//!
//! Advisory mutual exclusion keyed by profile id, guarding one resolve,
//! merge and persist critical section. Locks carry a TTL so a crashed
//! holder blocks its key only briefly; the data model tolerates the rare
//! concurrent merge this allows, since merges converge on replay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{Clock, Stamp, SystemClock};
use crate::error::{Error, Result};

/// Lock provider. Implementations are advisory: they serialize cooperating
/// trackers, nothing more.
#[async_trait]
pub trait ProfileLock: Send + Sync {
    /// Take the lock for `key` or fail fast with [`Error::LockBusy`].
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard>;
}

// A shared handle locks the same keys as the provider it wraps, so one
// lock can serialize trackers that were built separately.
#[async_trait]
impl<L: ProfileLock + ?Sized> ProfileLock for Arc<L> {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard> {
        (**self).acquire(key, ttl).await
    }
}

/// Held lock. Dropping the guard releases the key.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A guard protecting nothing, for callers that lock conditionally.
    pub fn unlocked() -> Self {
        Self { release: None }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// In-process [`ProfileLock`] tracking per-key expiry deadlines.
pub struct MemoryLock {
    held: Arc<DashMap<String, Stamp>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            held: Arc::new(DashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl ProfileLock for MemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard> {
        let now = self.clock.now();
        let deadline = now + ttl.as_secs_f64();
        match self.held.entry(key.to_string()) {
            Entry::Occupied(entry) if *entry.get() > now => {
                return Err(Error::LockBusy(key.to_string()));
            }
            // Expired holder; take the key over.
            Entry::Occupied(mut entry) => {
                entry.insert(deadline);
            }
            Entry::Vacant(slot) => {
                slot.insert(deadline);
            }
        }
        let held = Arc::clone(&self.held);
        let key = key.to_string();
        // Release compares the stored deadline, so a guard outliving its
        // TTL cannot evict whoever took the key over.
        Ok(LockGuard::new(move || {
            held.remove_if(&key, |_, stored| *stored == deadline);
        }))
    }
}
