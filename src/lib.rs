//! Gatekeeper - Pluggable Rate Limiting Core
//!
//! This crate decides, for a `(context, subject)` pair, whether the next unit
//! of work may proceed. Each context carries a policy, either a fixed window
//! or a token bucket, and state is kept per subject. The in-process
//! [`RateLimiter`](ratelimit::RateLimiter) serializes updates per key over a
//! pluggable state store; the
//! [`DistributedRateLimiter`](ratelimit::DistributedRateLimiter) delegates
//! each decision to a shared atomic store so many processes agree.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::GatekeeperConfig;
pub use error::{BackendError, GatekeeperError, Result};
