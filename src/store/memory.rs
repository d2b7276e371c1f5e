//! In-process counter/block store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::RateLimitStore;
use crate::error::StoreError;
use crate::ratelimit::RateLimitState;

/// Counter for one identity inside its current window.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    /// Requests counted in this window
    count: u64,
    /// When the window ends; armed once, on the first increment
    expires_at: Instant,
}

impl WindowEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.count > 0 && self.expires_at > now
    }
}

/// Block marker for one identity.
#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    expires_at: Instant,
    /// Wall-clock expiry reported by snapshots
    until: DateTime<Utc>,
}

/// A store that keeps counters and block markers in process memory.
///
/// Increments take the shard lock of the key's entry, so concurrent callers
/// sharing a `MemoryStore` never lose updates. State is not shared between
/// processes; use a networked store for that.
///
/// Expired entries read as absent immediately. They are physically removed
/// by [`MemoryStore::evict_expired`], which the sweeper started with
/// [`MemoryStore::spawn_sweeper`] calls periodically.
pub struct MemoryStore {
    counters: DashMap<String, WindowEntry>,
    blocks: DashMap<String, BlockEntry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create an empty store without a sweeper.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            blocks: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Start a background task that evicts expired entries every `interval`.
    ///
    /// The task holds only a weak reference and ends once the store is
    /// dropped. Calling this again replaces the previous sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let store = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.evict_expired();
                if evicted > 0 {
                    trace!(evicted, "Swept expired rate limit entries");
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Memory store sweeper started");
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Remove every expired counter and block marker.
    ///
    /// Returns the number of entries removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len() + self.blocks.len();

        self.counters.retain(|_, entry| entry.is_live(now));
        self.blocks.retain(|_, entry| entry.expires_at > now);

        before.saturating_sub(self.counters.len() + self.blocks.len())
    }

    /// Number of counters currently held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of block markers currently held, expired or not.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Drop all state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.counters.clear();
        self.blocks.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn out_of_range(what: &str, duration: Duration) -> StoreError {
    StoreError::Backend(format!("{what} {duration:?} out of range"))
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(WindowEntry {
                count: 0,
                expires_at: now,
            });

        if entry.is_live(now) {
            entry.count += 1;
        } else {
            // First increment of a new window arms its expiry
            entry.expires_at = now
                .checked_add(window)
                .ok_or_else(|| out_of_range("window", window))?;
            entry.count = 1;
            debug!(key = %key, window_ms = window.as_millis() as u64, "Opened new window");
        }

        Ok(entry.count)
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now()
            .checked_add(duration)
            .ok_or_else(|| out_of_range("block duration", duration))?;
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| out_of_range("block duration", duration))?;

        self.blocks.insert(key.to_string(), BlockEntry { expires_at, until });
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .blocks
            .get(key)
            .is_some_and(|entry| entry.expires_at > now))
    }

    async fn get_state(&self, key: &str) -> Result<RateLimitState, StoreError> {
        let now = Instant::now();

        let count = self
            .counters
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.count);

        let blocked_until = self
            .blocks
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.until);

        Ok(RateLimitState {
            key: key.to_string(),
            count,
            blocked_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_increment_counts_within_window() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("k", Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(store.increment("k", Duration::from_secs(1)).await.unwrap(), 2);
        assert_eq!(store.increment("other", Duration::from_secs(1)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_resets_after_expiry() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(1);

        store.increment("k", window).await.unwrap();
        store.increment("k", window).await.unwrap();

        tokio::time::advance(window + Duration::from_millis(1)).await;
        assert_eq!(store.increment("k", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_increments_do_not_extend_window() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);

        store.increment("k", window).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.increment("k", window).await.unwrap(), 2);

        // Ten seconds after the first increment the window is gone, even
        // though the second one happened only five seconds ago
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.increment("k", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_and_expiry() {
        let store = MemoryStore::new();

        assert!(!store.is_blocked("k").await.unwrap());
        store.block("k", Duration::from_secs(10)).await.unwrap();
        assert!(store.is_blocked("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.is_blocked("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reblock_replaces_duration() {
        let store = MemoryStore::new();

        store.block("k", Duration::from_secs(10)).await.unwrap();
        store.block("k", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.is_blocked("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_missing_key() {
        let store = MemoryStore::new();

        let state = store.get_state("nonexistent").await.unwrap();
        assert_eq!(state.key, "nonexistent");
        assert_eq!(state.count, 0);
        assert!(state.blocked_until.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_block_expires_before_counter() {
        let store = MemoryStore::new();

        store.increment("k", Duration::from_secs(20)).await.unwrap();
        store.block("k", Duration::from_secs(10)).await.unwrap();

        let state = store.get_state("k").await.unwrap();
        assert_eq!(state.count, 1);
        assert!(state.blocked_until.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        let state = store.get_state("k").await.unwrap();
        assert_eq!(state.count, 1);
        assert!(state.blocked_until.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_is_stable() {
        let store = MemoryStore::new();
        store.increment("k", Duration::from_secs(5)).await.unwrap();
        store.block("k", Duration::from_secs(5)).await.unwrap();

        let first = store.get_state("k").await.unwrap();
        let second = store.get_state("k").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let store = MemoryStore::new();

        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();
        store.block("short", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.evict_expired(), 2);
        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_in_background() {
        let store = Arc::new(MemoryStore::new());
        store.spawn_sweeper(Duration::from_millis(100));

        store.increment("k", Duration::from_millis(50)).await.unwrap();
        assert_eq!(store.counter_count(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment("shared", Duration::from_secs(60)).await.unwrap()
                })
            })
            .collect();

        let mut counts = Vec::with_capacity(tasks.len());
        for task in futures::future::join_all(tasks).await {
            counts.push(task.unwrap());
        }
        counts.sort_unstable();

        // Every caller observed a distinct count
        assert_eq!(counts, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_unrepresentable_durations_are_errors() {
        let store = MemoryStore::new();

        let result = store.increment("k", Duration::MAX).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        // A failed increment leaves no live counter behind
        assert_eq!(store.get_state("k").await.unwrap().count, 0);
        assert_eq!(store.increment("k", Duration::from_secs(1)).await.unwrap(), 1);

        let result = store.block("k", Duration::MAX).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(!store.is_blocked("k").await.unwrap());
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::new();
        tokio_test::block_on(store.increment("k", Duration::from_secs(1))).unwrap();
        assert_eq!(store.counter_count(), 1);

        store.clear();
        assert_eq!(store.counter_count(), 0);
    }
}
