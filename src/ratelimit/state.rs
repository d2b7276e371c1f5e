//! Decision and state snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The identity already carried an unexpired block marker
    Blocked,
    /// This request pushed the window count over the quota
    QuotaExceeded,
}

/// Outcome of an admission decision.
///
/// A denial is a normal outcome, not an error; store failures are reported
/// separately through `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    /// Let the request through
    Allowed,
    /// Reject the request
    Denied(DenyReason),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Point-in-time view of one identity's counter and block marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Namespaced identity key
    pub key: String,
    /// Requests counted in the current window, zero when no window is open
    pub count: u64,
    /// When the block marker expires, if the identity is blocked
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Whether the snapshot shows an active block.
    pub fn is_blocked(&self) -> bool {
        self.blocked_until.is_some()
    }
}
