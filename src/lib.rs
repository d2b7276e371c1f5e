//! Tollgate - Fixed-Window Admission Control
//!
//! This crate decides, per request, whether an identity (client address or
//! access token) is admitted under a per-window quota, and blocks identities
//! that exceed it for a fixed duration. All counting state lives behind the
//! [`store::RateLimitStore`] trait, so any number of workers and processes
//! sharing one store enforce a single quota.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
