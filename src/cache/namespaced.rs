//! Namespaced cache over the shared store with a local fallback.
//!
//! Writes always land in the local fallback and, while connected, in the
//! shared store too. Reads prefer the shared store and fall back to the
//! local copy on any error. During an outage each shard therefore serves its
//! own view of the data: availability wins over cross-shard consistency
//! until the store comes back.

use crate::CACHE_TARGET;
use crate::cache::local::{CacheStats, LocalBoundedCache};
use crate::store::{SharedStoreClient, namespaced_key};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Construction parameters for [`NamespacedCache`]
#[derive(Debug, Clone)]
pub struct NamespacedCacheOptions {
    pub local_capacity: usize,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    pub namespace_ttls: HashMap<String, Duration>,
}

impl Default for NamespacedCacheOptions {
    fn default() -> Self {
        Self {
            local_capacity: 10_000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            namespace_ttls: HashMap::new(),
        }
    }
}

/// Shard-safe cache keyed by `namespace:key`
pub struct NamespacedCache {
    store: SharedStoreClient,
    local: LocalBoundedCache<String>,
    default_ttl: Duration,
    namespace_ttls: HashMap<String, Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for NamespacedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedCache")
            .field("store", &self.store)
            .field("local", &self.local)
            .field("namespace_ttls", &self.namespace_ttls)
            .finish_non_exhaustive()
    }
}

enum Lookup {
    Hit(String),
    Miss,
}

impl NamespacedCache {
    /// Build the cache and start the local fallback's sweep.
    #[must_use]
    pub fn new(store: SharedStoreClient, options: NamespacedCacheOptions) -> Self {
        Self {
            store,
            local: LocalBoundedCache::with_sweep(
                options.local_capacity,
                options.default_ttl,
                options.sweep_interval,
            ),
            default_ttl: options.default_ttl,
            namespace_ttls: options.namespace_ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Default TTL for a namespace
    #[must_use]
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.namespace_ttls
            .get(namespace)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Typed accessor bound to one namespace and value schema.
    #[must_use]
    pub fn namespace<V>(self: &Arc<Self>, name: impl Into<String>) -> TypedNamespace<V> {
        let name = name.into();
        let ttl = self.ttl_for(&name);
        TypedNamespace {
            cache: Arc::clone(self),
            name,
            ttl,
            _schema: PhantomData,
        }
    }

    /// Shared store first, then the local fallback. `touch` refreshes the
    /// fallback entry's recency and counts towards its statistics.
    async fn lookup(&self, full_key: &str, touch: bool) -> Lookup {
        if self.store.is_connected() {
            match self.store.get(full_key).await {
                Ok(Some(raw)) => return Lookup::Hit(raw),
                Ok(None) => return Lookup::Miss,
                Err(e) => debug!(target: CACHE_TARGET, key = full_key, error = %e, "Shared store read failed, using local fallback"),
            }
        }
        let local = if touch {
            self.local.get(full_key)
        } else {
            self.local.peek(full_key)
        };
        match local {
            Some(raw) => Lookup::Hit(raw),
            None => Lookup::Miss,
        }
    }

    fn decode<V: DeserializeOwned>(&self, full_key: &str, raw: &str) -> Option<V> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(target: CACHE_TARGET, key = full_key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Read a value. A payload that fails to decode from the shared store is
    /// retried against the local fallback, then treated as a miss.
    pub async fn get<V: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<V> {
        let value = self.read(namespace, key, true).await;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Same as [`get`](Self::get) but leaves hit/miss statistics untouched.
    pub async fn peek<V: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<V> {
        self.read(namespace, key, false).await
    }

    async fn read<V: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        touch: bool,
    ) -> Option<V> {
        let full_key = namespaced_key(namespace, key);
        match self.lookup(&full_key, touch).await {
            Lookup::Hit(raw) => self.decode(&full_key, &raw).or_else(|| {
                self.local
                    .peek(&full_key)
                    .filter(|local| *local != raw)
                    .and_then(|local| self.decode(&full_key, &local))
            }),
            Lookup::Miss => None,
        }
    }

    /// Write a value with `ttl`, or the namespace default.
    pub async fn set<V: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) {
        let full_key = namespaced_key(namespace, key);
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(namespace));
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target: CACHE_TARGET, key = %full_key, error = %e, "Refusing to cache unserializable value");
                return;
            }
        };

        self.local.set_with_ttl(full_key.clone(), raw.clone(), ttl);
        if self.store.is_connected() {
            if let Err(e) = self.store.set_ex(&full_key, ttl, &raw).await {
                debug!(target: CACHE_TARGET, key = %full_key, error = %e, "Shared store write failed, local copy kept");
            }
        }
    }

    pub async fn delete(&self, namespace: &str, key: &str) {
        let full_key = namespaced_key(namespace, key);
        self.local.delete(&full_key);
        if self.store.is_connected() {
            if let Err(e) = self.store.del(&full_key).await {
                debug!(target: CACHE_TARGET, key = %full_key, error = %e, "Shared store delete failed");
            }
        }
    }

    /// Delete every key of `namespace` starting with `prefix`.
    pub async fn delete_by_prefix(&self, namespace: &str, prefix: &str) {
        let full_prefix = namespaced_key(namespace, prefix);
        let local = self.local.delete_prefix(&full_prefix);
        let mut shared = 0;
        if self.store.is_connected() {
            match self.store.del_prefix(&full_prefix).await {
                Ok(removed) => shared = removed,
                Err(e) => debug!(target: CACHE_TARGET, prefix = %full_prefix, error = %e, "Shared store prefix delete failed"),
            }
        }
        debug!(target: CACHE_TARGET, prefix = %full_prefix, local, shared, "Deleted cache entries by prefix");
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// Check-then-act: concurrent callers may both run `supplier`.
    pub async fn get_or_set<V, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Option<Duration>,
        supplier: F,
    ) -> V
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(value) = self.get(namespace, key).await {
            return value;
        }
        let value = supplier().await;
        self.set(namespace, key, &value, ttl).await;
        value
    }

    /// Hit/miss statistics of this cache plus the fallback's size and evictions
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let local = self.local.stats();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: local.evictions,
            size: local.size,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Stop the fallback's sweep and drop local entries.
    pub fn destroy(&self) {
        self.local.destroy();
    }
}

/// Cache accessor with a fixed namespace and value type
pub struct TypedNamespace<V> {
    cache: Arc<NamespacedCache>,
    name: String,
    ttl: Duration,
    _schema: PhantomData<fn() -> V>,
}

impl<V> Clone for TypedNamespace<V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            name: self.name.clone(),
            ttl: self.ttl,
            _schema: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for TypedNamespace<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedNamespace")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<V: Serialize + DeserializeOwned> TypedNamespace<V> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.cache.get(&self.name, key).await
    }

    pub async fn peek(&self, key: &str) -> Option<V> {
        self.cache.peek(&self.name, key).await
    }

    pub async fn set(&self, key: &str, value: &V) {
        self.cache.set(&self.name, key, value, Some(self.ttl)).await;
    }

    pub async fn set_with_ttl(&self, key: &str, value: &V, ttl: Duration) {
        self.cache.set(&self.name, key, value, Some(ttl)).await;
    }

    pub async fn delete(&self, key: &str) {
        self.cache.delete(&self.name, key).await;
    }

    /// Drop every key in this namespace.
    pub async fn clear(&self) {
        self.cache.delete_by_prefix(&self.name, "").await;
    }

    pub async fn get_or_set<F, Fut>(&self, key: &str, supplier: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        self.cache
            .get_or_set(&self.name, key, Some(self.ttl), supplier)
            .await
    }
}
