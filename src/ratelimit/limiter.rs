//! Fixed-window admission engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::LimitsConfig;
use crate::error::StoreError;
use crate::store::RateLimitStore;

use super::identity::{Identity, IdentityKey, QuotaClass};
use super::state::{Decision, DenyReason, RateLimitState};

/// Decides per request whether an identity is admitted.
///
/// The engine holds no mutable state; all counting and blocking lives in the
/// store, so one engine can be shared by every worker, and engines in
/// different processes agree as long as they share a store.
///
/// Per decision the engine performs at most three store calls, in order:
/// `is_blocked`, `increment`, and `block` when the quota is exceeded. A
/// blocked identity short-circuits before `increment`, so requests made
/// while blocked are never counted. The engine never retries; a retry would
/// count the request twice.
pub struct AdmissionEngine {
    store: Arc<dyn RateLimitStore>,
    limits: LimitsConfig,
    /// Deadline applied to each store call
    store_timeout: Option<Duration>,
}

impl AdmissionEngine {
    /// Create an engine over `store` with fixed limits.
    pub fn new(store: Arc<dyn RateLimitStore>, limits: LimitsConfig) -> Self {
        Self {
            store,
            limits,
            store_timeout: None,
        }
    }

    /// Bound every store call by `timeout`.
    ///
    /// A call that misses its deadline fails the decision with
    /// [`StoreError::Timeout`].
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Quota applying to a class of identity.
    pub fn quota(&self, class: QuotaClass) -> u64 {
        match class {
            QuotaClass::Ip => self.limits.max_requests,
            QuotaClass::Token => self.limits.max_token_requests,
        }
    }

    /// Decide whether the request from `identity` is admitted.
    ///
    /// A count equal to the quota is still admitted; the first request that
    /// takes the count past the quota is denied and arms the block.
    ///
    /// If arming the block fails, the decision fails too. The increment has
    /// already happened by then and is not rolled back.
    pub async fn decide(&self, identity: &Identity) -> Result<Decision, StoreError> {
        let key = IdentityKey::resolve(identity);
        let quota = self.quota(key.class());

        trace!(key = %key, quota, "Checking admission");

        let blocked = self
            .call("is_blocked", self.store.is_blocked(key.as_str()))
            .await?;
        if blocked {
            debug!(key = %key, "Identity is blocked");
            return Ok(Decision::Denied(DenyReason::Blocked));
        }

        let count = self
            .call(
                "increment",
                self.store.increment(key.as_str(), self.limits.window()),
            )
            .await?;

        if count > quota {
            let block_duration = self.limits.block_duration();
            self.call("block", self.store.block(key.as_str(), block_duration))
                .await?;

            debug!(
                key = %key,
                count,
                quota,
                block_secs = block_duration.as_secs(),
                "Quota exceeded, identity blocked"
            );
            return Ok(Decision::Denied(DenyReason::QuotaExceeded));
        }

        trace!(key = %key, count, quota, "Request admitted");
        Ok(Decision::Allowed)
    }

    /// Read the current counter and block marker for `identity`.
    ///
    /// Uses the same key resolution as [`AdmissionEngine::decide`] and never
    /// mutates state.
    pub async fn snapshot(&self, identity: &Identity) -> Result<RateLimitState, StoreError> {
        let key = IdentityKey::resolve(identity);
        self.call("get_state", self.store.get_state(key.as_str()))
            .await
    }

    /// Run a store call under the configured deadline.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let result = match self.store_timeout {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout { op, after }),
            },
            None => fut.await,
        };

        if let Err(ref e) = result {
            warn!(op, error = %e, "Store call failed");
        }
        result
    }
}
