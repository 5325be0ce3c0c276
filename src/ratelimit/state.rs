//! Limit state and decision types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutable per (context, subject) limit data.
///
/// A state always belongs to exactly one algorithm family; the algorithms
/// never read a state of the other family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimitState {
    /// Requests counted in the current window.
    FixedWindow {
        /// Accepted requests in this window
        count: u64,
        /// When the window resets
        expires_at: DateTime<Utc>,
    },
    /// Tokens left in a lazily refilled bucket.
    TokenBucket {
        /// Tokens currently held, in `[0, burst_capacity]`
        tokens: f64,
        /// When the bucket was last refilled; unset on a new bucket
        last_refreshed_at: Option<DateTime<Utc>>,
        /// When the bucket would be full again and may be pruned; unset if
        /// it never refills
        expires_at: Option<DateTime<Utc>>,
    },
}

impl LimitState {
    /// When this state stops being meaningful, if ever.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            LimitState::FixedWindow { expires_at, .. } => Some(*expires_at),
            LimitState::TokenBucket { expires_at, .. } => *expires_at,
        }
    }

    /// Whether the validity window has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| now >= expires_at)
    }

    /// Requests counted in the current window (fixed window only).
    pub fn count(&self) -> Option<u64> {
        match self {
            LimitState::FixedWindow { count, .. } => Some(*count),
            LimitState::TokenBucket { .. } => None,
        }
    }

    /// Tokens held (token bucket only).
    pub fn tokens(&self) -> Option<f64> {
        match self {
            LimitState::TokenBucket { tokens, .. } => Some(*tokens),
            LimitState::FixedWindow { .. } => None,
        }
    }
}

/// The answer to an accepted `decide` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// The state persisted by this decision. Absent when the limiter failed
    /// open on a backend error.
    pub state: Option<LimitState>,
    /// Hint of how many more requests would currently be accepted.
    pub remaining_capacity: Option<u64>,
    /// True when the request was let through because the backend failed.
    pub fail_open: bool,
}

impl Decision {
    /// An accepted decision with the state it persisted.
    pub fn accepted(state: LimitState, remaining_capacity: Option<u64>) -> Self {
        Self {
            state: Some(state),
            remaining_capacity,
            fail_open: false,
        }
    }

    /// A decision let through without consulting the backend.
    pub fn failed_open() -> Self {
        Self {
            state: None,
            remaining_capacity: None,
            fail_open: true,
        }
    }
}
