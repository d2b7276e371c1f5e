//! Redis-backed counter/block store.
//!
//! Each identity key owns two Redis keys: `rate:{key}` holds the window
//! counter and `block:{key}` holds the block marker. Both expire on their
//! own; nothing else is persisted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{info, warn};

use super::RateLimitStore;
use crate::error::StoreError;
use crate::ratelimit::RateLimitState;

/// Increment and arm the expiry in one server-side step, so the expiry is
/// set exactly once per window even if the client disappears in between.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

fn counter_key(key: &str) -> String {
    format!("rate:{key}")
}

fn block_key(key: &str) -> String {
    format!("block:{key}")
}

fn millis(duration: Duration) -> u64 {
    // PEXPIRE/PX reject zero; oversized values are left for Redis to reject
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn backend_error(op: &str) -> impl FnOnce(redis::RedisError) -> StoreError + '_ {
    move |e| {
        warn!(op, error = %e, "Redis command failed");
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Unavailable(format!("Redis {op} failed: {e}"))
        } else {
            StoreError::Backend(format!("Redis {op} failed: {e}"))
        }
    }
}

/// Counter/block store shared by every process pointing at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    increment: Script,
}

impl RedisStore {
    /// Connect to Redis at `url` and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid Redis URL: {e}")))?;

        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(backend_error("PING"))?;

        info!(url = %url, "Connected to Redis store");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = self
            .increment
            .key(counter_key(key))
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error("INCR"))?;
        Ok(count)
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| StoreError::Backend(format!("block duration {duration:?} out of range")))?;

        // The marker's value is its own wall-clock expiry for snapshots
        let _: () = redis::cmd("SET")
            .arg(block_key(key))
            .arg(until.timestamp_millis())
            .arg("PX")
            .arg(millis(duration))
            .query_async(&mut conn)
            .await
            .map_err(backend_error("SET"))?;
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend_error("EXISTS"))?;
        Ok(exists)
    }

    async fn get_state(&self, key: &str) -> Result<RateLimitState, StoreError> {
        let mut conn = self.connection.clone();

        let count: Option<u64> = redis::cmd("GET")
            .arg(counter_key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend_error("GET"))?;

        let until: Option<i64> = redis::cmd("GET")
            .arg(block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend_error("GET"))?;

        Ok(RateLimitState {
            key: key.to_string(),
            count: count.unwrap_or(0),
            blocked_until: until.and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance at REDIS_URL
    // (default redis://127.0.0.1:6379).

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique_key(name: &str) -> String {
        format!("tollgate-test:{}:{}", std::process::id(), name)
    }

    #[test]
    fn test_key_families() {
        assert_eq!(counter_key("ip:10.0.0.1"), "rate:ip:10.0.0.1");
        assert_eq!(block_key("token:abc"), "block:token:abc");
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let result = RedisStore::connect("not a url").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_increment_multiple() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("increment");

        assert_eq!(store.increment(&key, Duration::from_millis(300)).await.unwrap(), 1);
        assert_eq!(store.increment(&key, Duration::from_millis(300)).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.increment(&key, Duration::from_millis(300)).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_later_increments_do_not_extend_window() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("arm-once");
        let window = Duration::from_millis(600);

        assert_eq!(store.increment(&key, window).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.increment(&key, window).await.unwrap(), 2);

        // 700ms after the first increment the window is gone, although the
        // second one was only 300ms ago
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.increment(&key, window).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_block_state_is_stable() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("stable");

        store.block(&key, Duration::from_secs(5)).await.unwrap();
        let first = store.get_state(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = store.get_state(&key).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_block_and_is_blocked() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("block");

        store.block(&key, Duration::from_millis(300)).await.unwrap();
        assert!(store.is_blocked(&key).await.unwrap());

        let state = store.get_state(&key).await.unwrap();
        assert!(state.blocked_until.is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!store.is_blocked(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_get_state_no_key() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();

        let state = store.get_state(&unique_key("missing")).await.unwrap();
        assert_eq!(state.count, 0);
        assert!(state.blocked_until.is_none());
    }
}
