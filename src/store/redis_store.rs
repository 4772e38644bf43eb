//! Redis implementation of the shared store.
//!
//! The connection manager is created lazily on first use and afterwards
//! reconnects on its own, so a shard can start while Redis is down. Every
//! command is bounded by the configured operation timeout.
//!
//! Set-once expiry relies on `PEXPIRE ... NX`, available from Redis 7.0.

use crate::clock::duration_ms;
use crate::error::{StoreError, StoreResult};
use crate::store::{CounterHit, SharedStore, TtlPolicy};
use async_trait::async_trait;
use glob::Pattern;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SCAN_BATCH: usize = 200;

/// Deletes `KEYS[1]` only while it still holds `ARGV[1]`
const DEL_IF_EQ_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    del_if_eq_script: Script,
    /// Prefix applied to every key, e.g. `shardguard:` so the bot can share a
    /// Redis instance with other applications
    prefix: String,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("op_timeout", &self.op_timeout)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for `url` without connecting yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Command`] if the URL cannot be parsed.
    pub fn new(url: &str, prefix: impl Into<String>, op_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Command(format!("Invalid shared store URL: {e}")))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            del_if_eq_script: Script::new(DEL_IF_EQ_SCRIPT),
            prefix: prefix.into(),
            op_timeout,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to shared store");
                Ok::<_, redis::RedisError>(manager)
            })
            .await?;
        Ok(connection.clone())
    }

    /// Run a command future under the operation timeout.
    async fn bounded<T, F>(&self, command: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, command).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", Pattern::escape(&self.key(prefix)));
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        // SCAN instead of KEYS so a large keyspace never blocks the server
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(duration_ms(ttl).max(1)).unwrap_or(i64::MAX)
}

/// Convert a `PTTL` reply (-2 missing, -1 no expiry) into a duration
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get(self.key(key))).await
    }

    async fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        self.bounded(conn.set_ex(self.key(key), value, ttl_secs(ttl)))
            .await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: u64 = self.bounded(conn.del(self.key(key))).await?;
        Ok(removed > 0)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let mut invocation = self.del_if_eq_script.key(self.key(key));
        invocation.arg(expected);
        let removed: u64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(removed > 0)
    }

    async fn del_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let keys = self.scan(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let count: u64 = self.bounded(conn.del(chunk.to_vec())).await?;
            removed += count;
        }
        debug!(prefix, removed, "Deleted shared store keys by prefix");
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .scan(prefix)
            .await?
            .iter()
            .map(|key| self.strip(key).to_string())
            .collect())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        self.bounded(conn.incr(self.key(key), 1i64)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        self.bounded(conn.pexpire(self.key(key), ttl_millis(ttl)))
            .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.connection().await?;
        let pttl: i64 = self.bounded(conn.pttl(self.key(key))).await?;
        Ok(pttl_to_duration(pttl))
    }

    async fn incr_with_expire(
        &self,
        key: &str,
        ttl: Duration,
        policy: TtlPolicy,
    ) -> StoreResult<CounterHit> {
        let mut conn = self.connection().await?;
        let key = self.key(key);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.incr(&key, 1i64);
        match policy {
            TtlPolicy::ResetOnHit => {
                pipe.cmd("PEXPIRE").arg(&key).arg(ttl_millis(ttl)).ignore();
            }
            TtlPolicy::SetOnce => {
                pipe.cmd("PEXPIRE")
                    .arg(&key)
                    .arg(ttl_millis(ttl))
                    .arg("NX")
                    .ignore();
            }
        }
        pipe.cmd("PTTL").arg(&key);

        let (count, pttl): (i64, i64) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(CounterHit {
            count,
            ttl: pttl_to_duration(pttl).unwrap_or(ttl),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = RedisStore::new("not a url", "sg:", Duration::from_millis(250));
        assert!(matches!(result, Err(StoreError::Command(_))));
    }

    #[test]
    fn test_key_prefixing() {
        let store = RedisStore::new("redis://127.0.0.1/", "sg:", Duration::from_millis(250))
            .expect("valid url");
        assert_eq!(store.key("guild:1"), "sg:guild:1");
        assert_eq!(store.strip("sg:guild:1"), "guild:1");
        assert_eq!(store.strip("other:1"), "other:1");
    }

    #[test]
    fn test_pttl_conversion() {
        assert_eq!(pttl_to_duration(-2), None);
        assert_eq!(pttl_to_duration(-1), None);
        assert_eq!(pttl_to_duration(1500), Some(Duration::from_millis(1500)));
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
