//! In-memory shared store
//!
//! Implements the full [`SharedStore`] contract inside the process. Used as
//! the local emulation of counters and deadlines while the real store is
//! unreachable, and as the "shared" store in tests where several shards are
//! built on one `Arc<MemoryStore>`.

use crate::error::{StoreError, StoreResult};
use crate::store::{CounterHit, MAX_LOCAL_TTL, SharedStore, TtlPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use glob::Pattern;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now + ttl.min(MAX_LOCAL_TTL)
}

/// Process-local implementation of the shared store contract
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; while unavailable every command fails with
    /// [`StoreError::Unavailable`], like a store behind a dead network.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys, including ones awaiting the sweep
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired key, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Sweep expired keys on a fixed interval until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = store.upgrade() else { break };
                let removed = live.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired local store keys");
                }
            }
        })
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn prefix_pattern(prefix: &str) -> StoreResult<Pattern> {
        Pattern::new(&format!("{}*", Pattern::escape(prefix)))
            .map_err(|e| StoreError::Command(format!("Invalid key prefix '{prefix}': {e}")))
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<MemoryEntry> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.live_value(key, Instant::now()).map(|entry| entry.value))
    }

    async fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> StoreResult<()> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(expiry(Instant::now(), ttl)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| !entry.is_expired(now) && entry.value == expected)
            .is_some())
    }

    async fn del_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.check_available()?;
        let pattern = Self::prefix_pattern(prefix)?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        Ok(u64::try_from(before.saturating_sub(self.entries.len())).unwrap_or(u64::MAX))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let pattern = Self::prefix_pattern(prefix)?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.check_available()?;
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.is_expired(now) {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let count = entry
            .value
            .parse::<i64>()
            .map_err(|_| StoreError::Command(format!("Value at '{key}' is not an integer")))?
            + 1;
        entry.value = count.to_string();
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(expiry(now, ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .live_value(key, now)
            .and_then(|entry| entry.remaining(now)))
    }

    async fn incr_with_expire(
        &self,
        key: &str,
        ttl: Duration,
        policy: TtlPolicy,
    ) -> StoreResult<CounterHit> {
        self.check_available()?;
        let now = Instant::now();
        // The entry guard holds the shard lock, so the increment and the
        // expiry update are applied together.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.is_expired(now) {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let count = entry
            .value
            .parse::<i64>()
            .map_err(|_| StoreError::Command(format!("Value at '{key}' is not an integer")))?
            + 1;
        entry.value = count.to_string();
        match policy {
            TtlPolicy::ResetOnHit => entry.expires_at = Some(expiry(now, ttl)),
            TtlPolicy::SetOnce => {
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(expiry(now, ttl));
                }
            }
        }
        Ok(CounterHit {
            count,
            ttl: entry.remaining(now).unwrap_or(ttl),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
