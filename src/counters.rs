//! Window counters for spam, duplicate content, rate limits, automod warns
//! and cooldowns.
//!
//! Every counter is an atomic increment+expire on the shared store. The two
//! TTL policies stay separate: spam tracking slides its window on
//! every hit, while rate limits and warn counts keep the expiry set by the
//! first hit. When the shared store cannot be reached the
//! same operations run on a process-local [`MemoryStore`], so callers always
//! get an answer.

use crate::error::StoreResult;
use crate::store::{CounterHit, MemoryStore, SharedStore, SharedStoreClient, TtlPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const AUTOMOD_NS: &str = "automod";
const RATE_LIMIT_NS: &str = "ratelimit";
const COOLDOWN_NS: &str = "cooldown";

/// Result of [`SlidingWindowCounters::track_duplicate_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateHit {
    /// How many times in a row the same content was seen inside the window
    pub count: i64,
    /// Whether this message started a new run of content
    pub is_new: bool,
}

/// Result of [`SlidingWindowCounters::check_rate_limit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: i64,
    /// Time until the window resets
    pub reset_in: Duration,
}

impl RateLimitDecision {
    fn from_hit(hit: CounterHit, limit: i64) -> Self {
        Self {
            allowed: hit.count <= limit,
            remaining: (limit - hit.count).max(0),
            reset_in: hit.ttl,
        }
    }
}

/// Non-cryptographic content fingerprint (64-bit FNV-1a over the trimmed,
/// lowercased content)
#[must_use]
pub fn fingerprint(content: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = content
        .trim()
        .to_lowercase()
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
    format!("{hash:016x}")
}

#[derive(Debug, Clone)]
pub struct SlidingWindowCounters {
    store: SharedStoreClient,
    local: Arc<MemoryStore>,
}

impl SlidingWindowCounters {
    #[must_use]
    pub fn new(store: SharedStoreClient) -> Self {
        Self {
            store,
            local: Arc::new(MemoryStore::new()),
        }
    }

    /// Periodically drop expired keys from the local emulation.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.local.spawn_sweeper(interval)
    }

    async fn increment(&self, key: &str, window: Duration, policy: TtlPolicy) -> CounterHit {
        if self.store.is_connected() {
            match self.store.incr_with_expire(key, window, policy).await {
                Ok(hit) => return hit,
                Err(e) => debug!(key, %policy, error = %e, "Counter falling back to local state"),
            }
        }
        match self.local.incr_with_expire(key, window, policy).await {
            Ok(hit) => hit,
            Err(e) => {
                debug!(key, error = %e, "Local counter reset after corrupt value");
                let _ = self.local.del(key).await;
                self.local
                    .incr_with_expire(key, window, policy)
                    .await
                    .unwrap_or(CounterHit { count: 1, ttl: window })
            }
        }
    }

    /// Count a message from `user_id` in `guild_id`, sliding the window on
    /// every message. Returns the new count.
    pub async fn track_spam_message(&self, guild_id: u64, user_id: u64, window: Duration) -> i64 {
        let key = format!("{AUTOMOD_NS}:spam:{guild_id}:{user_id}");
        self.increment(&key, window, TtlPolicy::ResetOnHit).await.count
    }

    /// Count consecutive repeats of the same content.
    pub async fn track_duplicate_message(
        &self,
        guild_id: u64,
        user_id: u64,
        content: &str,
        window: Duration,
    ) -> DuplicateHit {
        let base = format!("{AUTOMOD_NS}:dup:{guild_id}:{user_id}");
        let fingerprint = fingerprint(content);

        if self.store.is_connected() {
            match duplicate_on(&self.store, &base, &fingerprint, window).await {
                Ok(hit) => return hit,
                Err(e) => debug!(key = %base, error = %e, "Duplicate tracking falling back to local state"),
            }
        }
        duplicate_on(self.local.as_ref(), &base, &fingerprint, window)
            .await
            .unwrap_or(DuplicateHit {
                count: 1,
                is_new: true,
            })
    }

    /// Fixed-window rate limit: `limit` hits per `window`, the window starting
    /// at the first hit.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> RateLimitDecision {
        let key = format!("{RATE_LIMIT_NS}:{key}");
        let hit = self.increment(&key, window, TtlPolicy::SetOnce).await;
        RateLimitDecision::from_hit(hit, limit)
    }

    /// Record an automod warning; the count returns to zero once `reset`
    /// passes after the first warning of the run.
    pub async fn track_automod_warn(&self, guild_id: u64, user_id: u64, reset: Duration) -> i64 {
        let key = format!("{AUTOMOD_NS}:warns:{guild_id}:{user_id}");
        self.increment(&key, reset, TtlPolicy::SetOnce).await.count
    }

    /// Put `action` on cooldown for `subject` for `ttl`.
    pub async fn set_cooldown(&self, subject: &str, action: &str, ttl: Duration) {
        let key = format!("{COOLDOWN_NS}:{subject}:{action}");
        let expires_at = crate::clock::now_ms() + crate::clock::duration_ms(ttl);
        let value = expires_at.to_string();
        if self.store.is_connected() {
            match self.store.set_ex(&key, ttl, &value).await {
                Ok(()) => return,
                Err(e) => debug!(key, error = %e, "Cooldown falling back to local state"),
            }
        }
        let _ = self.local.set_ex(&key, ttl, &value).await;
    }

    /// Time left on a cooldown, `None` when it is not active.
    pub async fn cooldown_remaining(&self, subject: &str, action: &str) -> Option<Duration> {
        let key = format!("{COOLDOWN_NS}:{subject}:{action}");
        if self.store.is_connected() {
            match self.store.ttl(&key).await {
                Ok(remaining) => return remaining,
                Err(e) => debug!(key, error = %e, "Cooldown read falling back to local state"),
            }
        }
        self.local.ttl(&key).await.ok().flatten()
    }

    /// Drop every automod counter of a guild, e.g. when the bot leaves it.
    pub async fn forget_guild(&self, guild_id: u64) {
        for kind in ["spam", "dup", "warns"] {
            let prefix = format!("{AUTOMOD_NS}:{kind}:{guild_id}:");
            if self.store.is_connected() {
                if let Err(e) = self.store.del_prefix(&prefix).await {
                    debug!(prefix, error = %e, "Failed to clear shared counters");
                }
            }
            let _ = self.local.del_prefix(&prefix).await;
        }
    }
}

/// Duplicate tracking against one backend. Different content restarts the
/// run at 1 with a fresh window; the same content increments it and
/// refreshes both keys.
async fn duplicate_on(
    store: &dyn SharedStore,
    base: &str,
    fingerprint: &str,
    window: Duration,
) -> StoreResult<DuplicateHit> {
    let hash_key = format!("{base}:hash");
    let count_key = format!("{base}:count");

    if store.get(&hash_key).await?.as_deref() == Some(fingerprint) {
        let hit = store
            .incr_with_expire(&count_key, window, TtlPolicy::ResetOnHit)
            .await?;
        store.expire(&hash_key, window).await?;
        return Ok(DuplicateHit {
            count: hit.count,
            is_new: hit.count == 1,
        });
    }

    store.set_ex(&hash_key, window, fingerprint).await?;
    store.set_ex(&count_key, window, "1").await?;
    Ok(DuplicateHit {
        count: 1,
        is_new: true,
    })
}
