use std::time::Duration;

/// Tuning for one tracker instance.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Keep the requested profile id when synthesizing a profile for an id
    /// the store does not know, instead of minting a fresh one. Payloads
    /// can also request this per call.
    pub static_profile_id: bool,
    /// Advisory lock TTL covering one resolve/merge/persist critical
    /// section. A crashed holder blocks its key for at most this long.
    pub lock_ttl: Duration,
    /// Capacity of the best-effort profile cache, in records.
    pub cache_capacity: usize,
    /// Upper bound on records read per duplicate-discovery query.
    pub discovery_limit: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            static_profile_id: false,
            lock_ttl: Duration::from_secs(3),
            cache_capacity: 10_000,
            discovery_limit: 10_000,
        }
    }
}

impl TrackerConfig {
    /// Preset for deployments where callers own profile id assignment.
    pub fn static_ids() -> Self {
        Self {
            static_profile_id: true,
            ..Self::default()
        }
    }
}
