//! Connection-tracking client for the shared store.
//!
//! Wraps an optional [`SharedStore`] backend with a connected flag. While
//! disconnected every command fails fast with [`StoreError::Unavailable`]
//! without touching the network, and a background probe keeps trying the
//! backend until it answers again.

use crate::error::{StoreError, StoreResult};
use crate::store::{CounterHit, RetryConfig, SharedStore, TtlPolicy, retry};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client shared by every cache, counter and scheduler of a shard
#[derive(Clone)]
pub struct SharedStoreClient(Arc<ClientInner>);

struct ClientInner {
    backend: Option<Arc<dyn SharedStore>>,
    connected: AtomicBool,
    connect_policy: RetryConfig,
    reconnect_policy: RetryConfig,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SharedStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStoreClient")
            .field("has_backend", &self.0.backend.is_some())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SharedStoreClient {
    /// Client over `backend`; starts disconnected until [`connect`](Self::connect) succeeds.
    #[must_use]
    pub fn new(backend: Arc<dyn SharedStore>) -> Self {
        Self::with_policies(backend, RetryConfig::startup(), RetryConfig::reconnect())
    }

    #[must_use]
    pub fn with_policies(
        backend: Arc<dyn SharedStore>,
        connect_policy: RetryConfig,
        reconnect_policy: RetryConfig,
    ) -> Self {
        Self(Arc::new(ClientInner {
            backend: Some(backend),
            connected: AtomicBool::new(false),
            connect_policy,
            reconnect_policy,
            probe: Mutex::new(None),
        }))
    }

    /// Client with no shared store at all; everything runs on local state.
    #[must_use]
    pub fn local_only() -> Self {
        Self(Arc::new(ClientInner {
            backend: None,
            connected: AtomicBool::new(false),
            connect_policy: RetryConfig::startup(),
            reconnect_policy: RetryConfig::reconnect(),
            probe: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    /// Try to reach the backend under the bounded connect policy.
    ///
    /// On failure the client stays disconnected and a background probe keeps
    /// retrying; callers should not await this on their startup path, see
    /// [`connect_in_background`](Self::connect_in_background).
    pub async fn connect(&self) -> bool {
        let Some(backend) = self.0.backend.clone() else {
            info!("No shared store configured, running on local state only");
            return false;
        };

        match retry("shared_store_connect", &self.0.connect_policy, || backend.ping()).await {
            Ok(()) => {
                self.set_connected(true);
                true
            }
            Err(e) => {
                warn!("Shared store unreachable after startup retries, using local fallback: {e}");
                self.mark_disconnected();
                false
            }
        }
    }

    /// Spawn [`connect`](Self::connect) so shard startup never waits on the store.
    pub fn connect_in_background(&self) -> JoinHandle<bool> {
        let client = self.clone();
        tokio::spawn(async move { client.connect().await })
    }

    /// Stop the reconnect probe. Idempotent.
    pub fn shutdown(&self) {
        if let Some(handle) = self.lock_probe().take() {
            handle.abort();
        }
    }

    fn lock_probe(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.0
            .probe
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_connected(&self, connected: bool) {
        let was = self.0.connected.swap(connected, Ordering::SeqCst);
        if connected && !was {
            info!("Shared store connected");
        } else if !connected && was {
            warn!("Shared store connection lost, degrading to local state");
        }
    }

    /// Flag the store as down and start the reconnect probe if none is running.
    fn mark_disconnected(&self) {
        self.set_connected(false);
        let Some(backend) = self.0.backend.clone() else {
            return;
        };

        let mut probe = self.lock_probe();
        if probe.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let client = self.clone();
        let policy = self.0.reconnect_policy.clone();
        *probe = Some(tokio::spawn(async move {
            if retry("shared_store_reconnect", &policy, || backend.ping())
                .await
                .is_ok()
            {
                client.set_connected(true);
            }
        }));
    }

    /// The backend, if the store is currently believed reachable.
    fn live_backend(&self) -> StoreResult<Arc<dyn SharedStore>> {
        match &self.0.backend {
            Some(backend) if self.is_connected() => Ok(Arc::clone(backend)),
            _ => Err(StoreError::Unavailable),
        }
    }

    /// Inspect a command result, flipping to disconnected on connectivity errors.
    fn observe<T>(&self, operation: &str, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e) = &result {
            debug!(operation, error = %e, "Shared store command failed");
            if e.is_connectivity() {
                self.mark_disconnected();
            }
        }
        result
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let backend = self.live_backend()?;
        let result = backend.get(key).await;
        self.observe("GET", result)
    }

    pub async fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> StoreResult<()> {
        let backend = self.live_backend()?;
        let result = backend.set_ex(key, ttl, value).await;
        self.observe("SETEX", result)
    }

    pub async fn del(&self, key: &str) -> StoreResult<bool> {
        let backend = self.live_backend()?;
        let result = backend.del(key).await;
        self.observe("DEL", result)
    }

    pub async fn del_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let backend = self.live_backend()?;
        let result = backend.del_if_eq(key, expected).await;
        self.observe("DEL-IF-EQ", result)
    }

    pub async fn del_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let backend = self.live_backend()?;
        let result = backend.del_prefix(prefix).await;
        self.observe("DEL-PREFIX", result)
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let backend = self.live_backend()?;
        let result = backend.keys_with_prefix(prefix).await;
        self.observe("SCAN", result)
    }

    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        let backend = self.live_backend()?;
        let result = backend.incr(key).await;
        self.observe("INCR", result)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let backend = self.live_backend()?;
        let result = backend.expire(key, ttl).await;
        self.observe("EXPIRE", result)
    }

    pub async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let backend = self.live_backend()?;
        let result = backend.ttl(key).await;
        self.observe("TTL", result)
    }

    pub async fn incr_with_expire(
        &self,
        key: &str,
        ttl: Duration,
        policy: TtlPolicy,
    ) -> StoreResult<CounterHit> {
        let backend = self.live_backend()?;
        let result = backend.incr_with_expire(key, ttl, policy).await;
        self.observe("INCR+EXPIRE", result)
    }
}

/// Lets code written against [`SharedStore`] run on the client or on a local
/// [`MemoryStore`](crate::store::MemoryStore) interchangeably.
#[async_trait]
impl SharedStore for SharedStoreClient {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Self::get(self, key).await
    }

    async fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> StoreResult<()> {
        Self::set_ex(self, key, ttl, value).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Self::del(self, key).await
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        Self::del_if_eq(self, key, expected).await
    }

    async fn del_prefix(&self, prefix: &str) -> StoreResult<u64> {
        Self::del_prefix(self, prefix).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Self::keys_with_prefix(self, prefix).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        Self::incr(self, key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        Self::expire(self, key, ttl).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        Self::ttl(self, key).await
    }

    async fn incr_with_expire(
        &self,
        key: &str,
        ttl: Duration,
        policy: TtlPolicy,
    ) -> StoreResult<CounterHit> {
        Self::incr_with_expire(self, key, ttl, policy).await
    }

    async fn ping(&self) -> StoreResult<()> {
        let backend = self.live_backend()?;
        let result = backend.ping().await;
        self.observe("PING", result)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut probe) = self.probe.lock() {
            if let Some(handle) = probe.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn client_over(store: &Arc<MemoryStore>) -> SharedStoreClient {
        SharedStoreClient::with_policies(
            Arc::clone(store) as Arc<dyn SharedStore>,
            RetryConfig::test(),
            RetryConfig::test(),
        )
    }

    #[tokio::test]
    async fn test_connect_marks_connected() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(&store);
        assert!(!client.is_connected());
        assert!(client.connect().await);
        assert!(client.is_connected());
        assert_eq!(client.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_client_disconnected() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let client = client_over(&store);
        assert!(!client.connect().await);
        assert!(!client.is_connected());
        assert!(matches!(client.get("k").await, Err(StoreError::Unavailable)));
        client.shutdown();
    }

    #[tokio::test]
    async fn test_outage_flips_flag_and_probe_restores_it() {
        let store = Arc::new(MemoryStore::new());
        let client = SharedStoreClient::with_policies(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            RetryConfig::test(),
            RetryConfig {
                max_retries: None,
                ..RetryConfig::test()
            },
        );
        assert!(client.connect().await);

        store.set_available(false);
        assert!(client.get("k").await.is_err());
        assert!(!client.is_connected());

        store.set_available(true);
        for _ in 0..100 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_local_only_client_never_connects() {
        let client = SharedStoreClient::local_only();
        assert!(!client.connect().await);
        assert!(matches!(client.incr("k").await, Err(StoreError::Unavailable)));
    }
}
