use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;

/// Build an LRU cache whose entries expire after `ttl` without access.
#[inline]
pub fn new_cache<K, V>(max_capacity: u64, ttl: Duration) -> Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(max_capacity)
        .time_to_idle(ttl)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Blocked,
    Allowed,
    Unknown,
}

/// Two independently bounded tiers remembering blocklist answers.
///
/// A name lives in at most one tier: recording into one tier inserts there
/// and then invalidates the other, so whichever write finishes last wins.
/// Lookups check the blocked tier first.
#[derive(Clone)]
pub struct DecisionCache {
    blocked: Cache<Arc<str>, ()>,
    allowed: Cache<Arc<str>, ()>,
}

impl DecisionCache {
    pub fn new(blocked_capacity: u64, allowed_capacity: u64, ttl: Duration) -> Self {
        Self {
            blocked: new_cache(blocked_capacity, ttl),
            allowed: new_cache(allowed_capacity, ttl),
        }
    }

    pub fn lookup(&self, name: &str) -> Verdict {
        if self.blocked.get(name).is_some() {
            Verdict::Blocked
        } else if self.allowed.get(name).is_some() {
            Verdict::Allowed
        } else {
            Verdict::Unknown
        }
    }

    pub fn record_blocked(&self, name: &str) {
        self.blocked.insert(Arc::from(name), ());
        self.allowed.invalidate(name);
    }

    pub fn record_allowed(&self, name: &str) {
        self.allowed.insert(Arc::from(name), ());
        self.blocked.invalidate(name);
    }

    /// Test whether `name` sits in each tier without touching its recency.
    #[cfg(test)]
    pub(crate) fn residency(&self, name: &str) -> (bool, bool) {
        (self.blocked.contains_key(name), self.allowed.contains_key(name))
    }

    #[cfg(test)]
    fn sync(&self) {
        self.blocked.run_pending_tasks();
        self.allowed.run_pending_tasks();
    }
}
