//! Distributed rate limiter over a shared atomic store.
//!
//! Every limiter instance pointed at the same store shares one view of each
//! subject's state. The fetch/decide/persist step runs inside the store as a
//! single atomic script, so no local locking is needed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, trace};

use super::algorithm::REQUESTED_TOKENS;
use super::backend::{FailurePolicy, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::key::StateKey;
use super::policy::{Limit, Policy, PolicyKind};
use super::policy_store::PolicyStore;
use super::shared::{
    token_bucket_ttl_seconds, FixedWindowArgs, ScriptReply, SharedAtomicStore, TokenBucketArgs,
};
use super::state::{Decision, LimitState};
use crate::config::GatekeeperConfig;
use crate::error::{BackendError, GatekeeperError, Result};

/// Default prefix for keys written to the shared store.
const DEFAULT_KEY_PREFIX: &str = "gatekeeper:";

/// A rate limiter whose state lives in a shared atomic store.
///
/// The token bucket runs on whole seconds of the caller's clock; instances
/// should keep their clocks in sync.
pub struct DistributedRateLimiter {
    policies: Arc<PolicyStore>,
    store: Arc<dyn SharedAtomicStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    key_prefix: String,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("store", &self.store)
            .field("failure_policy", &self.failure_policy)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl DistributedRateLimiter {
    /// Create a distributed limiter over a shared store.
    pub fn new(policies: PolicyStore, store: Arc<dyn SharedAtomicStore>) -> Self {
        Self::with_clock(policies, store, Arc::new(SystemClock))
    }

    /// Create a distributed limiter with a specific clock.
    pub fn with_clock(
        policies: PolicyStore,
        store: Arc<dyn SharedAtomicStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies: Arc::new(policies),
            store,
            clock,
            failure_policy: FailurePolicy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Create a distributed limiter from configuration over a connected store.
    pub fn from_config(
        config: &GatekeeperConfig,
        store: Arc<dyn SharedAtomicStore>,
    ) -> Result<Self> {
        let policies =
            PolicyStore::with_policies(config.defaults.clone(), config.policies.iter().cloned())?;
        let mut limiter =
            Self::new(policies, store).with_failure_policy(config.limiter.failure_policy);
        if let Some(shared) = &config.shared_store {
            limiter = limiter.with_key_prefix(shared.key_prefix.clone());
        }
        Ok(limiter)
    }

    /// Builder-style: set the backend failure policy.
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Builder-style: set the prefix of every key written to the store.
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Decide whether the next unit of work for a subject may proceed.
    pub async fn decide(&self, context_key: &str, subject_key: &str) -> Result<Decision> {
        let policy = self.policies.resolve(context_key)?;
        let key = StateKey::new(context_key, subject_key);

        trace!(
            key = %key,
            algorithm = policy.kind.algorithm(),
            "Checking distributed rate limit"
        );

        // Nothing to ask the store when the answer is fixed.
        let closed = matches!(
            policy.kind,
            PolicyKind::FixedWindow {
                limit: Limit::Bounded(0),
                ..
            }
        );
        if !policy.enabled || closed {
            return Err(reject(&key, policy, None));
        }

        let now = self.clock.now();
        let result = match policy.kind {
            PolicyKind::FixedWindow { limit, window } => {
                self.fixed_window(&key, limit, window, now).await
            }
            PolicyKind::TokenBucket {
                replenish_rate,
                burst_capacity,
            } => {
                self.token_bucket(&key, replenish_rate, burst_capacity, now)
                    .await
            }
        };

        match result {
            Ok((true, state, remaining_capacity)) => {
                Ok(Decision::accepted(state, remaining_capacity))
            }
            Ok((false, state, _)) => Err(reject(&key, policy, Some(state))),
            Err(error) => self.failure_policy.on_backend_error(&key, error),
        }
    }

    async fn fixed_window(
        &self,
        key: &StateKey,
        limit: Limit,
        window: std::time::Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<(bool, LimitState, Option<u64>), BackendError> {
        let window_ms = window.as_millis().min(u64::MAX as u128) as u64;
        let args = FixedWindowArgs {
            limit: match limit {
                Limit::Bounded(limit) => Some(limit),
                Limit::Unlimited => None,
            },
            window_ms,
        };
        let reply = self
            .store
            .eval_atomic_fixed_window(&key.fixed_window_key(&self.key_prefix), args)
            .await?;

        let count = non_negative(reply.value);
        let ttl_ms = match reply.ttl_ms {
            Some(ttl) if ttl >= 0 => ttl,
            _ => window_ms.min(i64::MAX as u64) as i64,
        };
        let state = LimitState::FixedWindow {
            count,
            expires_at: now
                .checked_add_signed(Duration::milliseconds(ttl_ms))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let remaining = match limit {
            Limit::Bounded(limit) => Some(limit.saturating_sub(count)),
            Limit::Unlimited => None,
        };

        Ok((reply.allowed, state, remaining))
    }

    async fn token_bucket(
        &self,
        key: &StateKey,
        replenish_rate: f64,
        burst_capacity: f64,
        now: DateTime<Utc>,
    ) -> std::result::Result<(bool, LimitState, Option<u64>), BackendError> {
        let now_seconds = now.timestamp();
        let (token_key, timestamp_key) = key.token_bucket_keys(&self.key_prefix);
        let args = TokenBucketArgs {
            replenish_rate,
            burst_capacity,
            now_seconds,
            requested_tokens: REQUESTED_TOKENS as u64,
        };
        let ScriptReply { allowed, value, .. } = self
            .store
            .eval_atomic_token_bucket(&token_key, &timestamp_key, args)
            .await?;

        let tokens = non_negative(value);
        let state = if allowed {
            let refreshed = Utc.timestamp_opt(now_seconds, 0).single().unwrap_or(now);
            LimitState::TokenBucket {
                tokens: tokens as f64,
                last_refreshed_at: Some(refreshed),
                expires_at: token_bucket_ttl_seconds(replenish_rate, burst_capacity)
                    .and_then(|ttl| refreshed.checked_add_signed(Duration::seconds(ttl))),
            }
        } else {
            LimitState::TokenBucket {
                tokens: tokens as f64,
                last_refreshed_at: None,
                expires_at: None,
            }
        };

        Ok((allowed, state, Some(tokens)))
    }
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

fn reject(key: &StateKey, policy: Policy, state: Option<LimitState>) -> GatekeeperError {
    debug!(
        key = %key,
        enabled = policy.enabled,
        "Distributed rate limit exceeded"
    );
    GatekeeperError::LimitExceeded { policy, state }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn decide(&self, context_key: &str, subject_key: &str) -> Result<Decision> {
        DistributedRateLimiter::decide(self, context_key, subject_key).await
    }

    fn policies(&self) -> &PolicyStore {
        &self.policies
    }
}
