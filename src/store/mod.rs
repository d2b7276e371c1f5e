//! Counter/block store contract and its implementations.
//!
//! The store is the only shared mutable state in the system. Every
//! implementation must make each primitive atomic per key under any number
//! of concurrent callers, including callers in other processes when the
//! backend is shared.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ratelimit::RateLimitState;

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// Atomic primitives the admission engine is built on.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment the window counter for `key` and return the new count.
    ///
    /// The expiry is armed with `window` only by the increment that takes
    /// the counter from absent to one; later increments in the same window
    /// must leave it untouched.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Set the block marker for `key`, replacing any existing marker.
    async fn block(&self, key: &str, duration: Duration) -> Result<(), StoreError>;

    /// Whether an unexpired block marker exists for `key`.
    async fn is_blocked(&self, key: &str) -> Result<bool, StoreError>;

    /// Best-effort snapshot of the counter and block marker for `key`.
    ///
    /// The two fields may be read at slightly different instants.
    async fn get_state(&self, key: &str) -> Result<RateLimitState, StoreError>;
}
