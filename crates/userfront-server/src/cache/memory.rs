//! Process-local cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheError, CacheKey, UserCache};

const BACKEND: &str = "memory";

/// Writes between two sweeps of expired entries.
const SWEEP_EVERY: usize = 256;

/// A cached entry with TTL support.
#[derive(Clone, Debug)]
struct CachedEntry {
    data: Arc<Vec<u8>>,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }

    fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.cached_at.elapsed())
    }
}

/// DashMap-backed cache with per-entry TTL.
///
/// Serves single-instance deployments with Redis disabled. Tests use
/// [`set_failing`](Self::set_failing) to simulate an outage: every call,
/// `ping` included, then returns `CacheError::Unavailable`.
///
/// Expired entries are dropped lazily on read and by a sweep every
/// `SWEEP_EVERY` writes, so keys that are never read again do not pile up.
#[derive(Debug, Default)]
pub struct InMemoryUserCache {
    entries: DashMap<String, CachedEntry>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryUserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Remaining time-to-live of a live entry.
    pub fn ttl_of(&self, key: &CacheKey) -> Option<Duration> {
        self.entries
            .get(&key.render())
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.remaining())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.ttl_of(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clean up expired entries.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserCache for InMemoryUserCache {
    async fn get_raw(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        self.check()?;
        let key = key.render();
        let Some(entry) = self.entries.get(&key) else {
            return Err(CacheError::Miss);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(&key);
            return Err(CacheError::Miss);
        }
        Ok(entry.data.as_ref().clone())
    }

    async fn set_raw(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check()?;
        self.entries.insert(key.render(), CachedEntry::new(value, ttl));
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            self.cleanup_expired();
        }
        Ok(())
    }

    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        match self.entries.get_mut(&key.render()) {
            Some(mut entry) if !entry.is_expired() => {
                entry.cached_at = Instant::now();
                entry.ttl = ttl;
                Ok(())
            }
            _ => Err(CacheError::Miss),
        }
    }

    async fn del(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.check()?;
        self.entries.remove(&key.render());
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }

    async fn close(&self) {
        self.entries.clear();
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
