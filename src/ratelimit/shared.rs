//! Shared atomic store capability for the distributed limiter.
//!
//! A shared store runs the whole fetch/decide/persist step of a decision as
//! one indivisible server-side operation, so limiter processes sharing it
//! cannot interleave on a key. Entries expire natively.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::algorithm::refill;
use super::clock::{Clock, SystemClock};
use crate::error::BackendError;

/// Arguments of the token-bucket script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketArgs {
    pub replenish_rate: f64,
    pub burst_capacity: f64,
    /// Caller's time in whole seconds since the Unix epoch
    pub now_seconds: i64,
    pub requested_tokens: u64,
}

/// Arguments of the fixed-window script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowArgs {
    /// Ceiling per window; `None` counts without a ceiling
    pub limit: Option<u64>,
    pub window_ms: u64,
}

/// Reply of an atomic script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    /// Tokens remaining (token bucket) or count in the window (fixed window)
    pub value: i64,
    /// Milliseconds until the window resets (fixed window only)
    pub ttl_ms: Option<i64>,
}

impl ScriptReply {
    /// Parse the integer array a script returns.
    pub fn from_values(values: &[i64]) -> Result<Self, BackendError> {
        match values {
            [allowed, value] => Ok(Self {
                allowed: *allowed == 1,
                value: *value,
                ttl_ms: None,
            }),
            [allowed, value, ttl_ms] => Ok(Self {
                allowed: *allowed == 1,
                value: *value,
                ttl_ms: Some(*ttl_ms),
            }),
            other => Err(BackendError::MalformedResponse(format!(
                "expected 2 or 3 integers, got {:?}",
                other
            ))),
        }
    }
}

/// A store able to run the limiting scripts atomically.
#[async_trait]
pub trait SharedAtomicStore: Send + Sync + std::fmt::Debug {
    /// Run the token-bucket arithmetic on `(token_key, timestamp_key)` as one
    /// atomic step. State is only written when the request is allowed.
    async fn eval_atomic_token_bucket(
        &self,
        token_key: &str,
        timestamp_key: &str,
        args: TokenBucketArgs,
    ) -> Result<ScriptReply, BackendError>;

    /// Count one request in the window at `key` as one atomic step. The
    /// count is only incremented when the request is allowed.
    async fn eval_atomic_fixed_window(
        &self,
        key: &str,
        args: FixedWindowArgs,
    ) -> Result<ScriptReply, BackendError>;
}

/// Seconds a token bucket lives after its last write: twice its fill time,
/// at least one second. `None` when it never refills.
pub fn token_bucket_ttl_seconds(replenish_rate: f64, burst_capacity: f64) -> Option<i64> {
    if replenish_rate <= 0.0 {
        return None;
    }
    Some(((burst_capacity / replenish_rate * 2.0).floor() as i64).max(1))
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: f64,
    expires_at: Option<DateTime<Utc>>,
}

/// Shared store living in this process.
///
/// Runs each script under one lock, the way a single-threaded store server
/// would. Useful for tests and for several limiters in one process.
#[derive(Debug)]
pub struct LocalAtomicStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl LocalAtomicStore {
    /// Create a store expiring entries by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store expiring entries by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at.map_or(true, |at| now < at))
            .count()
    }

    /// Whether no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(entries: &mut HashMap<String, Entry>, key: &str, now: DateTime<Utc>) -> Option<f64> {
        let entry = *entries.get(key)?;
        if entry.expires_at.is_some_and(|at| now >= at) {
            entries.remove(key);
            return None;
        }
        Some(entry.value)
    }
}

impl Default for LocalAtomicStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedAtomicStore for LocalAtomicStore {
    async fn eval_atomic_token_bucket(
        &self,
        token_key: &str,
        timestamp_key: &str,
        args: TokenBucketArgs,
    ) -> Result<ScriptReply, BackendError> {
        let now = Utc
            .timestamp_opt(args.now_seconds, 0)
            .single()
            .ok_or_else(|| BackendError::Script(format!("invalid time {}", args.now_seconds)))?;
        let wall = self.clock.now();

        let mut entries = self.entries.lock();
        let tokens = Self::live(&mut entries, token_key, wall).unwrap_or(args.burst_capacity);
        let last_refreshed_at = Self::live(&mut entries, timestamp_key, wall)
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());

        // Whole-second time base, like the server-side script.
        let filled = refill(
            tokens,
            last_refreshed_at,
            now,
            args.replenish_rate,
            args.burst_capacity,
        );
        let requested = args.requested_tokens as f64;
        if filled < requested {
            return Ok(ScriptReply {
                allowed: false,
                value: filled.floor() as i64,
                ttl_ms: None,
            });
        }

        let remaining = filled - requested;
        let expires_at = token_bucket_ttl_seconds(args.replenish_rate, args.burst_capacity)
            .map(|ttl| wall + Duration::seconds(ttl));
        entries.insert(
            token_key.to_string(),
            Entry {
                value: remaining,
                expires_at,
            },
        );
        entries.insert(
            timestamp_key.to_string(),
            Entry {
                value: args.now_seconds as f64,
                expires_at,
            },
        );

        Ok(ScriptReply {
            allowed: true,
            value: remaining.floor() as i64,
            ttl_ms: None,
        })
    }

    async fn eval_atomic_fixed_window(
        &self,
        key: &str,
        args: FixedWindowArgs,
    ) -> Result<ScriptReply, BackendError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let count = Self::live(&mut entries, key, now).unwrap_or(0.0) as i64;
        let ttl_ms = |entries: &HashMap<String, Entry>| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| (at - now).num_milliseconds().max(0))
                .unwrap_or(-1)
        };

        if args.limit.is_some_and(|limit| count >= limit as i64) {
            return Ok(ScriptReply {
                allowed: false,
                value: count,
                ttl_ms: Some(ttl_ms(&*entries)),
            });
        }

        let count = count + 1;
        let expires_at = match entries.get(key) {
            Some(entry) if count > 1 => entry.expires_at,
            _ => Some(now + Duration::milliseconds(args.window_ms.min(i64::MAX as u64) as i64)),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: count as f64,
                expires_at,
            },
        );

        Ok(ScriptReply {
            allowed: true,
            value: count,
            ttl_ms: Some(ttl_ms(&*entries)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn bucket_args(now_seconds: i64) -> TokenBucketArgs {
        TokenBucketArgs {
            replenish_rate: 1.0,
            burst_capacity: 3.0,
            now_seconds,
            requested_tokens: 1,
        }
    }

    #[test]
    fn test_reply_parsing() {
        assert_eq!(
            ScriptReply::from_values(&[1, 4]).unwrap(),
            ScriptReply {
                allowed: true,
                value: 4,
                ttl_ms: None
            }
        );
        assert_eq!(ScriptReply::from_values(&[0, 2, 900]).unwrap().ttl_ms, Some(900));
        assert!(matches!(
            ScriptReply::from_values(&[1]),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_ttl_seconds() {
        assert_eq!(token_bucket_ttl_seconds(10.0, 20.0), Some(4));
        assert_eq!(token_bucket_ttl_seconds(100.0, 1.0), Some(1));
        assert_eq!(token_bucket_ttl_seconds(0.0, 20.0), None);
    }

    #[tokio::test]
    async fn test_local_token_bucket() {
        let clock = ManualClock::default();
        let store = LocalAtomicStore::with_clock(Arc::new(clock.clone()));
        let now = clock.now().timestamp();

        for expected in [2, 1, 0] {
            let reply = store
                .eval_atomic_token_bucket("t", "ts", bucket_args(now))
                .await
                .unwrap();
            assert!(reply.allowed);
            assert_eq!(reply.value, expected);
        }

        let reply = store
            .eval_atomic_token_bucket("t", "ts", bucket_args(now))
            .await
            .unwrap();
        assert!(!reply.allowed);

        let reply = store
            .eval_atomic_token_bucket("t", "ts", bucket_args(now + 2))
            .await
            .unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.value, 1);
    }

    #[tokio::test]
    async fn test_local_token_bucket_expires_to_full() {
        let clock = ManualClock::default();
        let store = LocalAtomicStore::with_clock(Arc::new(clock.clone()));
        let now = clock.now().timestamp();

        store
            .eval_atomic_token_bucket("t", "ts", bucket_args(now))
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        clock.advance_millis(6_000);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_local_fixed_window() {
        let clock = ManualClock::default();
        let store = LocalAtomicStore::with_clock(Arc::new(clock.clone()));
        let args = FixedWindowArgs {
            limit: Some(2),
            window_ms: 1_000,
        };

        let first = store.eval_atomic_fixed_window("w", args).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.value, 1);
        assert_eq!(first.ttl_ms, Some(1_000));

        clock.advance_millis(400);
        let second = store.eval_atomic_fixed_window("w", args).await.unwrap();
        assert_eq!(second.value, 2);
        assert_eq!(second.ttl_ms, Some(600));

        let third = store.eval_atomic_fixed_window("w", args).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.value, 2);

        clock.advance_millis(600);
        let fourth = store.eval_atomic_fixed_window("w", args).await.unwrap();
        assert!(fourth.allowed);
        assert_eq!(fourth.value, 1);
    }
}
