//! Shared key/value store
//!
//! The shared store is the only channel through which shards coordinate.
//! This module defines the minimal command contract the rest of the crate
//! consumes, a Redis implementation, an in-memory implementation used both
//! as the local emulation during outages and as a test double, and the
//! connection-tracking client wrapped around them.

mod client;
mod memory;
mod redis_store;
mod retry;

pub use client::SharedStoreClient;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use retry::{RetryConfig, retry};

use crate::error::StoreResult;
use async_trait::async_trait;
use derive_more::Display;
use std::time::Duration;

/// Longest expiry kept by the in-process stores; longer TTLs are shortened
/// to it
pub const MAX_LOCAL_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// How an increment treats the key's time-to-live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TtlPolicy {
    /// Refresh the TTL on every increment, so sustained activity keeps
    /// postponing expiry (sliding window).
    #[display("reset-on-hit")]
    ResetOnHit,
    /// Only set the TTL when the key has none, i.e. on the first increment of
    /// a window (fixed window).
    #[display("set-once")]
    SetOnce,
}

/// Outcome of an atomic increment+expire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    /// Counter value after the increment
    pub count: i64,
    /// Time left before the counter expires
    pub ttl: Duration,
}

/// Minimal command contract of the shared store
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// `SETEX key ttl value`
    async fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> StoreResult<()>;

    /// `DEL key`, returning whether a live key was removed
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only while it still holds `expected`, as one atomic
    /// step. Returns whether the key was removed.
    async fn del_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Delete every key starting with `prefix`, returning how many went away
    async fn del_prefix(&self, prefix: &str) -> StoreResult<u64>;

    /// List live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// `INCR key`
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// `EXPIRE key ttl`, returning whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// `TTL key`; `None` when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Atomic `INCR` paired with an `EXPIRE` governed by `policy`
    async fn incr_with_expire(
        &self,
        key: &str,
        ttl: Duration,
        policy: TtlPolicy,
    ) -> StoreResult<CounterHit>;

    /// Liveness probe
    async fn ping(&self) -> StoreResult<()>;
}

/// Build a `namespace:key` string
#[must_use]
pub fn namespaced_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}
