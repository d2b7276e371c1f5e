//! Admission policy: identity resolution, the fixed-window decision engine
//! and state snapshots.

mod identity;
mod limiter;
mod state;

pub use identity::{Identity, IdentityKey, QuotaClass};
pub use limiter::AdmissionEngine;
pub use state::{Decision, DenyReason, RateLimitState};
