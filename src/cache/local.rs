//! Bounded in-process cache with TTL expiry and LRU eviction.

use crate::store::MAX_LOCAL_TTL;
use glob::Pattern;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A cached value with its expiry and recency bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    pub last_accessed: Instant,
    /// Monotonic access sequence; breaks ties between equal `last_accessed`
    /// instants so eviction order is deterministic.
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    /// Hit rate in 0.0-1.0, or 0.0 before any lookup
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug)]
struct Entries<V> {
    map: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
}

impl<V> Entries<V> {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, entry)| (entry.last_accessed, entry.seq))
            .map(|(key, _)| key.clone())?;
        self.map.remove(&victim);
        Some(victim)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before - self.map.len()
    }
}

/// Capacity- and TTL-bounded key/value cache.
///
/// Expired entries are removed lazily on read and by a periodic sweep.
/// `get_or_set` is check-then-populate: two callers racing on the same key
/// may both run their supplier, and the last write wins.
pub struct LocalBoundedCache<V> {
    entries: Arc<Mutex<Entries<V>>>,
    counters: Arc<Counters>,
    max_size: usize,
    default_ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + 'static> std::fmt::Debug for LocalBoundedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBoundedCache")
            .field("max_size", &self.max_size)
            .field("default_ttl", &self.default_ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<V: Clone + Send + 'static> LocalBoundedCache<V> {
    /// Create a cache holding at most `max_size` entries (clamped to 1).
    #[must_use]
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        if max_size == 0 {
            warn!("Local cache max size of 0 requested, clamping to 1");
        }
        Self {
            entries: Arc::new(Mutex::new(Entries {
                map: HashMap::new(),
                next_seq: 0,
            })),
            counters: Arc::new(Counters::default()),
            max_size: max_size.max(1),
            default_ttl,
            sweeper: Mutex::new(None),
        }
    }

    /// Create a cache and start its background sweep.
    #[must_use]
    pub fn with_sweep(max_size: usize, default_ttl: Duration, interval: Duration) -> Self {
        let cache = Self::new(max_size, default_ttl);
        cache.start_sweep(interval);
        cache
    }

    /// Start (or restart) the periodic removal of expired entries.
    pub fn start_sweep(&self, interval: Duration) {
        let entries: Weak<Mutex<Entries<V>>> = Arc::downgrade(&self.entries);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = entries.upgrade() else { break };
                let removed = lock(&live).purge_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "Swept expired local cache entries");
                }
            }
        });
        if let Some(previous) = lock(&self.sweeper).replace(handle) {
            previous.abort();
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up `key`, refreshing its recency. Expired entries are removed and
    /// count as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let seq = entries.bump();
        let value = match entries.map.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed = now;
                entry.seq = seq;
                Some(entry.value.clone())
            }
            _ => None,
        };
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            entries.map.remove(key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Look up `key` without touching statistics or recency.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        lock(&self.entries)
            .map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL. Evicts the least recently accessed entry
    /// first when the cache is full and `key` is new; overwriting never evicts.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        if !entries.map.contains_key(&key) && entries.map.len() >= self.max_size {
            if let Some(evicted) = entries.evict_lru() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %evicted, "Evicted least recently used cache entry");
            }
        }
        let seq = entries.bump();
        entries.map.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl.min(MAX_LOCAL_TTL),
                last_accessed: now,
                seq,
            },
        );
    }

    /// Whether a live entry exists. Does not count as a hit or miss.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let live = entries
            .map
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now));
        if !live {
            entries.map.remove(key);
        }
        live
    }

    pub fn delete(&self, key: &str) -> bool {
        lock(&self.entries).map.remove(key).is_some()
    }

    /// Delete every entry whose key starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.map.len();
        entries.map.retain(|key, _| !key.starts_with(prefix));
        before - entries.map.len()
    }

    /// Live keys
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        lock(&self.entries)
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Live keys matching a glob pattern such as `guild:*`
    #[must_use]
    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let Ok(pattern) = Pattern::new(pattern) else {
            return Vec::new();
        };
        self.keys()
            .into_iter()
            .filter(|key| pattern.matches(key))
            .collect()
    }

    /// Number of live entries
    #[must_use]
    pub fn size(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .map
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Return the cached value or populate it from `supplier`.
    ///
    /// Not atomic: the lock is released while the supplier runs.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Option<Duration>, supplier: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = supplier().await;
        self.set_with_ttl(key, value.clone(), ttl.unwrap_or(self.default_ttl));
        value
    }

    /// Remove every expired entry now.
    pub fn sweep(&self) -> usize {
        lock(&self.entries).purge_expired(Instant::now())
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size: self.size(),
        }
    }

    /// Stop the sweep and drop every entry. Safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
        lock(&self.entries).map.clear();
    }
}

impl<V> Drop for LocalBoundedCache<V> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_accessed() {
        let cache = LocalBoundedCache::new(3, TTL);
        cache.set("a", 1);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", 2);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("c", 3);
        tokio::time::advance(Duration::from_millis(10)).await;

        // touching "a" makes "b" the oldest
        assert_eq!(cache.get("a"), Some(1));
        cache.set("d", 4);

        assert!(!cache.has("b"));
        assert!(cache.has("a"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_break_by_access_order() {
        // clock is paused, so every entry shares the same last_accessed
        let cache = LocalBoundedCache::new(2, TTL);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3);
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_never_evicts() {
        let cache = LocalBoundedCache::new(2, TTL);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.peek("a"), Some(10));
        assert_eq!(cache.peek("b"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss_and_removed() {
        let cache = LocalBoundedCache::new(10, Duration::from_secs(5));
        cache.set("a", 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("a"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert!(cache.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_removes_expired() {
        let cache = LocalBoundedCache::with_sweep(10, TTL, Duration::from_secs(1));
        cache.set_with_ttl("short", 1, Duration::from_millis(500));
        cache.set("long", 2);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.peek("short"), None);
        assert_eq!(lock(&cache.entries).map.len(), 1);
        cache.destroy();
        cache.destroy();
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_peek_does_not_touch_stats() {
        let cache = LocalBoundedCache::new(10, TTL);
        cache.set("a", 1);
        assert_eq!(cache.peek("a"), Some(1));
        assert_eq!(cache.peek("missing"), None);
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_get_or_set_populates_once() {
        let cache = LocalBoundedCache::new(10, TTL);
        let first = cache.get_or_set("k", None, || async { 7 }).await;
        let second = cache.get_or_set("k", None, || async { 99 }).await;
        assert_eq!(first, 7);
        assert_eq!(second, 7);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache: LocalBoundedCache<u8> = LocalBoundedCache::new(0, TTL);
        assert_eq!(cache.max_size(), 1);
    }

    #[tokio::test]
    async fn test_prefix_and_pattern_helpers() {
        let cache = LocalBoundedCache::new(10, TTL);
        cache.set("guild:1", 1);
        cache.set("guild:2", 2);
        cache.set("voice:1", 3);
        let mut keys = cache.keys_matching("guild:*");
        keys.sort();
        assert_eq!(keys, vec!["guild:1", "guild:2"]);
        assert_eq!(cache.delete_prefix("guild:"), 2);
        assert_eq!(cache.keys(), vec!["voice:1"]);
    }
}
