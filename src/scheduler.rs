//! Distributed deadlines.
//!
//! A scheduled action is stored in the shared store under its subject with a
//! TTL slightly longer than its delay, and the scheduling shard also arms a
//! local timer for it. Whoever first sees the deadline pass deletes the
//! record it read, provided it is still the stored one; only the caller whose
//! delete removed it runs the action, so an action fires once even when
//! several shards poll. The local timer only
//! makes the common case fast: the poll loop fires actions whose shard died
//! or restarted.

use crate::clock::{duration_ms, now_ms};
use crate::store::{MemoryStore, SharedStore, SharedStoreClient, namespaced_key};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs the payload of a due deadline.
#[async_trait]
pub trait DeferredExecutor<P>: Send + Sync {
    /// Whether this shard should fire `subject` from its poll loop
    fn owns(&self, _subject: &str) -> bool {
        true
    }

    async fn execute(&self, subject: &str, payload: P);
}

/// Discord's guild-to-shard assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFilter {
    pub shard_id: u64,
    pub shard_count: u64,
}

impl ShardFilter {
    #[must_use]
    pub fn owns_guild(&self, guild_id: u64) -> bool {
        self.shard_count <= 1 || (guild_id >> 22) % self.shard_count == self.shard_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDeadline<P> {
    subject: String,
    deadline_ms: u64,
    /// Identifies one `schedule` call so a superseded local timer stays quiet
    token: Uuid,
    payload: P,
}

pub struct DeferredActionScheduler<P> {
    inner: Arc<SchedulerInner<P>>,
}

impl<P> Clone for DeferredActionScheduler<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SchedulerInner<P> {
    namespace: String,
    store: SharedStoreClient,
    local: Arc<MemoryStore>,
    executor: Arc<dyn DeferredExecutor<P>>,
    /// Local timers with the token of the `schedule` call that armed them
    timers: DashMap<String, (Uuid, JoinHandle<()>)>,
    poller: Mutex<Option<JoinHandle<()>>>,
    ttl_margin: Duration,
    _payload: PhantomData<fn() -> P>,
}

impl<P> std::fmt::Debug for DeferredActionScheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredActionScheduler")
            .field("namespace", &self.inner.namespace)
            .field("local_timers", &self.inner.timers.len())
            .finish()
    }
}

impl<P> DeferredActionScheduler<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Scheduler storing deadlines under `namespace:`.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        store: SharedStoreClient,
        executor: Arc<dyn DeferredExecutor<P>>,
        ttl_margin: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                namespace: namespace.into(),
                store,
                local: Arc::new(MemoryStore::new()),
                executor,
                timers: DashMap::new(),
                poller: Mutex::new(None),
                ttl_margin,
                _payload: PhantomData,
            }),
        }
    }

    fn key(&self, subject: &str) -> String {
        namespaced_key(&self.inner.namespace, subject)
    }

    /// Stores to try, shared store first. Deadlines written during an outage
    /// live in the local store.
    fn backends(&self) -> Vec<&dyn SharedStore> {
        let mut backends: Vec<&dyn SharedStore> = Vec::with_capacity(2);
        if self.inner.store.is_connected() {
            backends.push(&self.inner.store);
        }
        backends.push(self.inner.local.as_ref());
        backends
    }

    /// Run `payload` for `subject` after `delay`, replacing any pending
    /// action for the subject.
    pub async fn schedule(&self, subject: &str, delay: Duration, payload: P) {
        let token = Uuid::new_v4();
        let record = StoredDeadline {
            subject: subject.to_string(),
            deadline_ms: now_ms().saturating_add(duration_ms(delay)),
            token,
            payload,
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(subject, error = %e, "Refusing to schedule unserializable payload");
                return;
            }
        };
        let key = self.key(subject);
        let ttl = delay.saturating_add(self.inner.ttl_margin);

        let mut stored = false;
        if self.inner.store.is_connected() {
            match self.inner.store.set_ex(&key, ttl, &raw).await {
                Ok(()) => stored = true,
                Err(e) => debug!(key, error = %e, "Deadline kept locally"),
            }
        }
        // A stale local copy would otherwise resurface through the poll loop
        let _ = if stored {
            self.inner.local.del(&key).await.map(|_| ())
        } else {
            self.inner.local.set_ex(&key, ttl, &raw).await
        };

        self.arm_timer(subject, delay, token);
        debug!(subject, delay_ms = duration_ms(delay), "Scheduled deferred action");
    }

    fn arm_timer(&self, subject: &str, delay: Duration, token: Uuid) {
        let scheduler: Weak<SchedulerInner<P>> = Arc::downgrade(&self.inner);
        let owned_subject = subject.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = scheduler.upgrade() else { return };
            let scheduler = Self { inner };
            scheduler
                .inner
                .timers
                .remove_if(&owned_subject, |_, (armed, _)| *armed == token);
            scheduler.fire(&owned_subject, Some(token)).await;
        });
        let previous = self.inner.timers.insert(subject.to_string(), (token, handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Drop the pending action for `subject`, if any.
    pub async fn cancel(&self, subject: &str) {
        if let Some((_, (_, timer))) = self.inner.timers.remove(subject) {
            timer.abort();
        }
        let key = self.key(subject);
        for backend in self.backends() {
            if let Err(e) = backend.del(&key).await {
                debug!(key, error = %e, "Failed to delete deadline");
            }
        }
    }

    /// Whether an action is stored for `subject`
    pub async fn is_pending(&self, subject: &str) -> bool {
        let key = self.key(subject);
        for backend in self.backends() {
            if let Ok(Some(_)) = backend.get(&key).await {
                return true;
            }
        }
        false
    }

    /// Fire `subject` if its deadline has passed and we win the delete.
    /// With a `token`, only the matching `schedule` call may fire.
    async fn fire(&self, subject: &str, token: Option<Uuid>) -> bool {
        let key = self.key(subject);
        for backend in self.backends() {
            let raw = match backend.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    debug!(key, error = %e, "Deadline read failed");
                    continue;
                }
            };
            let record: StoredDeadline<P> = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key, error = %e, "Dropping undecodable deadline");
                    let _ = backend.del_if_eq(&key, &raw).await;
                    return false;
                }
            };
            if token.is_some_and(|token| token != record.token) || record.deadline_ms > now_ms() {
                return false;
            }
            // The delete is the claim: only one caller sees it succeed, and a
            // record rescheduled since the read is left alone
            match backend.del_if_eq(&key, &raw).await {
                Ok(true) => {
                    info!(subject, "Running deferred action");
                    self.inner.executor.execute(subject, record.payload).await;
                    return true;
                }
                Ok(false) => return false,
                Err(e) => {
                    debug!(key, error = %e, "Deadline claim failed");
                    return false;
                }
            }
        }
        false
    }

    /// Fire every due deadline this shard owns. Returns how many ran.
    pub async fn poll_once(&self) -> usize {
        let prefix = format!("{}:", self.inner.namespace);
        let mut subjects = Vec::new();
        for backend in self.backends() {
            match backend.keys_with_prefix(&prefix).await {
                Ok(keys) => subjects.extend(
                    keys.into_iter()
                        .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string)),
                ),
                Err(e) => debug!(prefix, error = %e, "Deadline scan failed"),
            }
        }
        subjects.sort();
        subjects.dedup();

        let mut fired = 0;
        for subject in subjects {
            if self.inner.executor.owns(&subject) && self.fire(&subject, None).await {
                fired += 1;
            }
        }
        fired
    }

    /// Start the poll loop. Calling it again restarts the loop.
    pub fn start(&self, interval: Duration) {
        let scheduler: Weak<SchedulerInner<P>> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = scheduler.upgrade() else { break };
                let fired = Self { inner }.poll_once().await;
                if fired > 0 {
                    debug!(fired, "Deadline poll fired actions");
                }
            }
        });
        let previous = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the poll loop and every local timer. Stored deadlines remain
    /// for the next poller.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl<P> SchedulerInner<P> {
    fn shutdown(&self) {
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            poller.abort();
        }
        self.timers.retain(|_, (_, timer)| {
            timer.abort();
            false
        });
    }
}

impl<P> Drop for SchedulerInner<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreResult;
    use crate::store::{CounterHit, RetryConfig, TtlPolicy};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, u64, u64)>>,
        owned: Option<String>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(String, u64, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeferredExecutor<u64> for Recorder {
        fn owns(&self, subject: &str) -> bool {
            self.owned.as_deref().is_none_or(|owned| owned == subject)
        }

        async fn execute(&self, subject: &str, payload: u64) {
            self.calls
                .lock()
                .unwrap()
                .push((subject.to_string(), payload, now_ms()));
        }
    }

    async fn connected(store: &Arc<MemoryStore>) -> SharedStoreClient {
        let client = SharedStoreClient::with_policies(
            Arc::clone(store) as Arc<dyn SharedStore>,
            RetryConfig::test(),
            RetryConfig::test(),
        );
        client.connect().await;
        client
    }

    fn scheduler(
        store: SharedStoreClient,
        recorder: &Arc<Recorder>,
    ) -> DeferredActionScheduler<u64> {
        DeferredActionScheduler::new(
            "voice",
            store,
            Arc::clone(recorder) as Arc<dyn DeferredExecutor<u64>>,
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_timer_fires_at_deadline() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(SharedStoreClient::local_only(), &recorder);
        let start = now_ms();
        scheduler.schedule("g1", Duration::from_secs(10), 7).await;

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(recorder.calls().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].0.as_str(), calls[0].1), ("g1", 7));
        assert!(calls[0].2 >= start + 10_000);
        assert!(!scheduler.is_pending("g1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_deadline_never_runs() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(SharedStoreClient::local_only(), &recorder);
        scheduler.schedule("g1", Duration::from_secs(10), 1).await;
        assert!(scheduler.is_pending("g1").await);
        scheduler.cancel("g1").await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(scheduler.poll_once().await, 0);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_runs_once_at_later_deadline() {
        let recorder = Arc::new(Recorder::default());
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(connected(&store).await, &recorder);
        let start = now_ms();
        scheduler.schedule("g1", Duration::from_secs(10), 1).await;
        scheduler.schedule("g1", Duration::from_secs(20), 2).await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(recorder.calls().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.poll_once().await, 0);

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 2);
        assert!(calls[0].2 >= start + 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_fires_for_dead_shard() {
        let store = Arc::new(MemoryStore::new());
        let dead_recorder = Arc::new(Recorder::default());
        let dead = scheduler(connected(&store).await, &dead_recorder);
        dead.schedule("g1", Duration::from_secs(10), 3).await;
        // The scheduling shard goes away before its timer fires
        dead.shutdown();
        drop(dead);

        let recorder = Arc::new(Recorder::default());
        let survivor = scheduler(connected(&store).await, &recorder);
        survivor.start(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(recorder.calls().len(), 1);
        assert!(dead_recorder.calls().is_empty());
        survivor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_pollers_execute_once() {
        let store = Arc::new(MemoryStore::new());
        let recorder_a = Arc::new(Recorder::default());
        let recorder_b = Arc::new(Recorder::default());
        let shard_a = scheduler(connected(&store).await, &recorder_a);
        let shard_b = scheduler(connected(&store).await, &recorder_b);

        shard_a.schedule("g1", Duration::from_secs(5), 9).await;
        shard_a.shutdown();
        tokio::time::advance(Duration::from_secs(6)).await;

        let (a, b) = tokio::join!(shard_a.poll_once(), shard_b.poll_once());
        assert_eq!(a + b, 1);
        assert_eq!(recorder_a.calls().len() + recorder_b.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_respects_ownership() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            owned: Some("mine".to_string()),
        });
        let scheduler = scheduler(connected(&store).await, &recorder);
        scheduler.schedule("mine", Duration::from_secs(1), 1).await;
        scheduler.schedule("theirs", Duration::from_secs(1), 2).await;
        scheduler.shutdown();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(scheduler.poll_once().await, 1);
        assert!(scheduler.is_pending("theirs").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_keeps_deadlines_locally() {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(connected(&store).await, &recorder);
        store.set_available(false);

        scheduler.schedule("g1", Duration::from_secs(3), 4).await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(recorder.calls().len(), 1);
    }

    /// Lands a newer deadline right after the first read, like another
    /// shard rescheduling between a poller's read and its claim
    #[derive(Default)]
    struct ReschedulingStore {
        inner: MemoryStore,
        newer: Mutex<Option<(String, String)>>,
    }

    #[async_trait]
    impl SharedStore for ReschedulingStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            let value = self.inner.get(key).await?;
            let newer = self.newer.lock().unwrap().take();
            if let Some((newer_key, raw)) = newer {
                self.inner
                    .set_ex(&newer_key, Duration::from_secs(600), &raw)
                    .await?;
            }
            Ok(value)
        }

        async fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> StoreResult<()> {
            self.inner.set_ex(key, ttl, value).await
        }

        async fn del(&self, key: &str) -> StoreResult<bool> {
            self.inner.del(key).await
        }

        async fn del_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
            self.inner.del_if_eq(key, expected).await
        }

        async fn del_prefix(&self, prefix: &str) -> StoreResult<u64> {
            self.inner.del_prefix(prefix).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.keys_with_prefix(prefix).await
        }

        async fn incr(&self, key: &str) -> StoreResult<i64> {
            self.inner.incr(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.inner.ttl(key).await
        }

        async fn incr_with_expire(
            &self,
            key: &str,
            ttl: Duration,
            policy: TtlPolicy,
        ) -> StoreResult<CounterHit> {
            self.inner.incr_with_expire(key, ttl, policy).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_spares_deadline_rescheduled_after_read() {
        let store = Arc::new(ReschedulingStore::default());
        let client = SharedStoreClient::with_policies(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            RetryConfig::test(),
            RetryConfig::test(),
        );
        client.connect().await;
        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(client, &recorder);
        scheduler.schedule("g1", Duration::from_secs(5), 1).await;
        scheduler.shutdown();
        tokio::time::advance(Duration::from_secs(6)).await;

        let newer = StoredDeadline {
            subject: "g1".to_string(),
            deadline_ms: now_ms() + 300_000,
            token: Uuid::new_v4(),
            payload: 2u64,
        };
        *store.newer.lock().unwrap() =
            Some(("voice:g1".to_string(), serde_json::to_string(&newer).unwrap()));

        assert_eq!(scheduler.poll_once().await, 0);
        assert!(recorder.calls().is_empty());
        assert!(scheduler.is_pending("g1").await);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(scheduler.poll_once().await, 1);
        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 2);
    }

    #[test]
    fn test_shard_filter() {
        let filter = ShardFilter {
            shard_id: 1,
            shard_count: 2,
        };
        assert!(filter.owns_guild(1 << 22));
        assert!(!filter.owns_guild(2 << 22));
        assert!(ShardFilter { shard_id: 0, shard_count: 1 }.owns_guild(12345));
    }
}
