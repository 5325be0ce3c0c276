//! The fixed-window and token-bucket limiting algorithms.
//!
//! Both algorithms are pure: given a policy, the current state and the time,
//! they return the next state or a rejection. Persisting the result and
//! serializing concurrent callers is the job of the limiter.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::policy::{Limit, Policy, PolicyKind};
use super::state::LimitState;

/// Tokens taken by one decision.
pub const REQUESTED_TOKENS: f64 = 1.0;

/// Result of applying a policy to a state.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The request may proceed; `state` must be persisted.
    Accepted {
        state: LimitState,
        remaining_capacity: Option<u64>,
    },
    /// The request is rejected; the persisted state must stay untouched.
    Rejected {
        /// The state that caused the rejection, if one existed.
        state: Option<LimitState>,
    },
}

impl Outcome {
    /// Whether the request was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }
}

/// Decide one request under `policy`.
///
/// A state of the other algorithm family (left behind when a context is
/// re-registered with a different algorithm) is treated as absent.
pub fn apply(policy: &Policy, current: Option<&LimitState>, now: DateTime<Utc>) -> Outcome {
    if !policy.enabled {
        return Outcome::Rejected {
            state: current.cloned(),
        };
    }

    match policy.kind {
        PolicyKind::FixedWindow { limit, window } => fixed_window(limit, window, current, now),
        PolicyKind::TokenBucket {
            replenish_rate,
            burst_capacity,
        } => token_bucket(replenish_rate, burst_capacity, current, now),
    }
}

fn fixed_window(
    limit: Limit,
    window: Duration,
    current: Option<&LimitState>,
    now: DateTime<Utc>,
) -> Outcome {
    if limit == Limit::Bounded(0) {
        return Outcome::Rejected {
            state: current.cloned(),
        };
    }

    let (count, expires_at) = match current {
        Some(LimitState::FixedWindow { count, expires_at }) if now < *expires_at => {
            (*count, *expires_at)
        }
        _ => (0, add_std(now, window)),
    };

    match limit {
        Limit::Bounded(limit) if count >= limit => Outcome::Rejected {
            state: current.cloned(),
        },
        Limit::Bounded(limit) => Outcome::Accepted {
            state: LimitState::FixedWindow {
                count: count + 1,
                expires_at,
            },
            remaining_capacity: Some(limit - count - 1),
        },
        Limit::Unlimited => Outcome::Accepted {
            state: LimitState::FixedWindow {
                count: count.saturating_add(1),
                expires_at,
            },
            remaining_capacity: None,
        },
    }
}

fn token_bucket(
    replenish_rate: f64,
    burst_capacity: f64,
    current: Option<&LimitState>,
    now: DateTime<Utc>,
) -> Outcome {
    let (tokens, last_refreshed_at) = match current {
        Some(LimitState::TokenBucket {
            tokens,
            last_refreshed_at,
            ..
        }) => (*tokens, *last_refreshed_at),
        _ => (burst_capacity, None),
    };

    let available = refill(tokens, last_refreshed_at, now, replenish_rate, burst_capacity);
    if available < REQUESTED_TOKENS {
        return Outcome::Rejected {
            state: current.cloned(),
        };
    }

    let tokens = available - REQUESTED_TOKENS;
    Outcome::Accepted {
        state: LimitState::TokenBucket {
            tokens,
            last_refreshed_at: Some(now),
            expires_at: bucket_expiry(now, replenish_rate, burst_capacity),
        },
        remaining_capacity: Some(tokens.floor() as u64),
    }
}

/// Tokens available at `now`, capped at `burst_capacity`.
///
/// A bucket that was never refreshed gets no elapsed-time credit.
pub fn refill(
    tokens: f64,
    last_refreshed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    replenish_rate: f64,
    burst_capacity: f64,
) -> f64 {
    let elapsed_ms = last_refreshed_at
        .map(|last| (now - last).num_milliseconds().max(0))
        .unwrap_or(0) as f64;
    let refilled = tokens + elapsed_ms * replenish_rate / 1000.0;
    refilled.min(burst_capacity).max(0.0)
}

/// Time at which a bucket refreshed at `now` is safely full again: twice the
/// fill time. A bucket that never refills never expires.
pub fn bucket_expiry(
    now: DateTime<Utc>,
    replenish_rate: f64,
    burst_capacity: f64,
) -> Option<DateTime<Utc>> {
    if replenish_rate <= 0.0 {
        return None;
    }
    let ttl_ms = (2.0 * burst_capacity / replenish_rate * 1000.0).ceil();
    let ttl = Duration::from_millis(ttl_ms.clamp(0.0, u64::MAX as f64) as u64);
    Some(add_std(now, ttl))
}

fn add_std(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
