//! Core in-process rate limiter implementation.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::algorithm::{self, Outcome};
use super::backend::{FailurePolicy, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::key::StateKey;
use super::policy_store::PolicyStore;
use super::state::{Decision, LimitState};
use super::store::{InMemoryStateStore, StateStore};
use crate::config::GatekeeperConfig;
use crate::error::{GatekeeperError, Result};

/// Default number of lock shards.
const DEFAULT_LOCK_SHARDS: usize = 64;

/// The rate limiter that composes a policy store, a state store and the
/// limiting algorithms.
///
/// The read-modify-write of one state key runs under that key's lock shard,
/// so concurrent decisions on one subject are serialized while unrelated
/// subjects mostly proceed in parallel. This struct is thread-safe and can
/// be shared across multiple tasks.
pub struct RateLimiter {
    policies: Arc<PolicyStore>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    locks: Box<[Mutex<()>]>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store)
            .field("failure_policy", &self.failure_policy)
            .field("lock_shards", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter with an in-memory store and the system clock.
    pub fn new(policies: PolicyStore) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryStateStore::with_clock(Arc::clone(&clock)));
        Self::with_store(policies, store, clock)
    }

    /// Create a rate limiter over a specific store and clock.
    ///
    /// The store should expire state against the same clock.
    pub fn with_store(
        policies: PolicyStore,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies: Arc::new(policies),
            store,
            clock,
            failure_policy: FailurePolicy::default(),
            locks: new_locks(DEFAULT_LOCK_SHARDS),
        }
    }

    /// Create a rate limiter from configuration, with an in-memory store.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        let policies =
            PolicyStore::with_policies(config.defaults.clone(), config.policies.iter().cloned())?;

        Ok(Self::new(policies)
            .with_failure_policy(config.limiter.failure_policy)
            .with_lock_shards(config.limiter.lock_shards))
    }

    /// Builder-style: set the backend failure policy.
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Builder-style: set the number of lock shards (at least one).
    pub fn with_lock_shards(mut self, shards: usize) -> Self {
        self.locks = new_locks(shards);
        self
    }

    /// The policy store.
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// Decide whether the next unit of work for a subject may proceed.
    ///
    /// Fails with `ContextNotFound` when the context cannot be resolved,
    /// `LimitExceeded` when the algorithm rejects, and `Backend` when the
    /// store fails and the limiter fails closed.
    pub async fn decide(&self, context_key: &str, subject_key: &str) -> Result<Decision> {
        let policy = self.policies.resolve(context_key)?;
        let key = StateKey::new(context_key, subject_key);

        trace!(
            key = %key,
            algorithm = policy.kind.algorithm(),
            "Checking rate limit"
        );

        let _guard = self.lock_for(&key).lock().await;

        let current = match self.store.get(&key).await {
            Ok(current) => current,
            Err(error) => return self.failure_policy.on_backend_error(&key, error),
        };

        if current.is_none() {
            debug!(key = %key, "Creating new limit state");
        }

        match algorithm::apply(&policy, current.as_ref(), self.clock.now()) {
            Outcome::Accepted {
                state,
                remaining_capacity,
            } => {
                if let Err(error) = self.store.put(&key, state.clone()).await {
                    return self.failure_policy.on_backend_error(&key, error);
                }
                Ok(Decision::accepted(state, remaining_capacity))
            }
            Outcome::Rejected { state } => {
                debug!(
                    key = %key,
                    enabled = policy.enabled,
                    "Rate limit exceeded"
                );
                Err(GatekeeperError::LimitExceeded { policy, state })
            }
        }
    }

    /// Read the persisted state for a subject without deciding anything.
    pub async fn state(&self, context_key: &str, subject_key: &str) -> Result<Option<LimitState>> {
        let key = StateKey::new(context_key, subject_key);
        Ok(self.store.get(&key).await?)
    }

    /// Remove expired state from a store that does not prune itself.
    ///
    /// Returns the number of states removed; always zero for self-pruning
    /// stores, which are never asked to sweep.
    pub async fn sweep_expired(&self) -> Result<usize> {
        if self.store.self_pruning() {
            return Ok(0);
        }
        Ok(self.store.sweep_expired().await?)
    }

    /// Sweep expired state on a fixed interval in the background.
    ///
    /// Returns `None` for self-pruning stores. The task stops on its own
    /// once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if self.store.self_pruning() {
            debug!("State store prunes itself, not starting sweeper");
            return None;
        }

        let limiter = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };

                match limiter.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed = removed, "Swept expired limit state"),
                    Err(error) => warn!(error = %error, "Sweep of expired limit state failed"),
                }
            }
        }))
    }

    fn lock_for(&self, key: &StateKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() % self.locks.len() as u64) as usize;
        &self.locks[shard]
    }
}

fn new_locks(shards: usize) -> Box<[Mutex<()>]> {
    (0..shards.max(1)).map(|_| Mutex::new(())).collect()
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn decide(&self, context_key: &str, subject_key: &str) -> Result<Decision> {
        RateLimiter::decide(self, context_key, subject_key).await
    }

    fn policies(&self) -> &PolicyStore {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::policy::{Limit, Policy, PolicyTemplate};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn limiter_with_clock(template: PolicyTemplate) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStateStore::with_clock(Arc::clone(&shared)));
        (
            RateLimiter::with_store(PolicyStore::new(template), store, shared),
            clock,
        )
    }

    /// A store whose reads or writes can be made to fail.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: InMemoryStateStore,
        fail_get: AtomicBool,
        fail_put: AtomicBool,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn get(
            &self,
            key: &StateKey,
        ) -> std::result::Result<Option<LimitState>, BackendError> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("connection refused".into()));
            }
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &StateKey,
            state: LimitState,
        ) -> std::result::Result<(), BackendError> {
            if self.fail_put.load(Ordering::SeqCst) {
                return Err(BackendError::Timeout(100));
            }
            self.inner.put(key, state).await
        }

        fn self_pruning(&self) -> bool {
            false
        }

        async fn sweep_expired(&self) -> std::result::Result<usize, BackendError> {
            self.inner.sweep_expired().await
        }
    }

    /// A store that claims native expiry and counts sweep calls.
    #[derive(Debug, Default)]
    struct TtlStore {
        inner: InMemoryStateStore,
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for TtlStore {
        async fn get(
            &self,
            key: &StateKey,
        ) -> std::result::Result<Option<LimitState>, BackendError> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &StateKey,
            state: LimitState,
        ) -> std::result::Result<(), BackendError> {
            self.inner.put(key, state).await
        }

        fn self_pruning(&self) -> bool {
            true
        }

        async fn sweep_expired(&self) -> std::result::Result<usize, BackendError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_decide_creates_state() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::fixed_window(
            Limit::Bounded(10),
            Duration::from_secs(1),
        ));

        let decision = assert_ok!(limiter.decide("api", "user-1").await);
        assert_eq!(decision.remaining_capacity, Some(9));
        assert!(!decision.fail_open);

        let state = limiter.state("api", "user-1").await.unwrap();
        assert_eq!(state.and_then(|s| s.count()), Some(1));
    }

    #[tokio::test]
    async fn test_decide_unknown_context() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::strict());

        let err = assert_err!(limiter.decide("missing", "user").await);
        assert!(matches!(err, GatekeeperError::ContextNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejection_carries_policy_and_state() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::strict());
        limiter
            .policies()
            .register(Policy::fixed_window("login", Limit::Bounded(1), Duration::from_secs(60)))
            .unwrap();

        assert_ok!(limiter.decide("login", "alice").await);
        let err = assert_err!(limiter.decide("login", "alice").await);

        match err {
            GatekeeperError::LimitExceeded { policy, state } => {
                assert_eq!(policy.context_key, "login");
                assert_eq!(state.and_then(|s| s.count()), Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_does_not_mutate_state() {
        let (limiter, clock) = limiter_with_clock(PolicyTemplate::token_bucket(1.0, 2.0));

        assert_ok!(limiter.decide("ctx", "s").await);
        assert_ok!(limiter.decide("ctx", "s").await);
        let before = limiter.state("ctx", "s").await.unwrap();

        clock.advance_millis(300);
        assert_err!(limiter.decide("ctx", "s").await);
        assert_eq!(limiter.state("ctx", "s").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_disabled_context_rejects() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::default().enabled(false));

        let err = assert_err!(limiter.decide("ctx", "s").await);
        assert!(err.is_limit_exceeded());
        assert_eq!(limiter.state("ctx", "s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_template_rejects_instead_of_admitting() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::token_bucket(f64::NAN, 2.0));

        for _ in 0..10 {
            let err = assert_err!(limiter.decide("uploads", "s").await);
            assert!(matches!(err, GatekeeperError::InvalidPolicy { .. }));
        }
        assert_eq!(limiter.state("uploads", "s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subjects_and_contexts_are_independent() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::fixed_window(
            Limit::Bounded(1),
            Duration::from_secs(1),
        ));

        assert_ok!(limiter.decide("a", "user").await);
        assert_ok!(limiter.decide("b", "user").await);
        assert_ok!(limiter.decide("a", "other").await);
        assert_err!(limiter.decide("a", "user").await);
    }

    #[tokio::test]
    async fn test_fail_closed_on_backend_error() {
        let store = Arc::new(FlakyStore::default());
        store.fail_get.store(true, Ordering::SeqCst);
        let limiter = RateLimiter::with_store(
            PolicyStore::new(PolicyTemplate::default()),
            store.clone(),
            Arc::new(SystemClock),
        );

        let err = assert_err!(limiter.decide("ctx", "s").await);
        assert!(matches!(err, GatekeeperError::Backend(_)));
    }

    #[tokio::test]
    async fn test_fail_open_on_backend_error() {
        let store = Arc::new(FlakyStore::default());
        let limiter = RateLimiter::with_store(
            PolicyStore::new(PolicyTemplate::default()),
            store.clone(),
            Arc::new(SystemClock),
        )
        .with_failure_policy(FailurePolicy::FailOpen);

        store.fail_put.store(true, Ordering::SeqCst);
        let decision = assert_ok!(limiter.decide("ctx", "s").await);
        assert!(decision.fail_open);
        assert_eq!(decision.state, None);

        store.fail_put.store(false, Ordering::SeqCst);
        store.fail_get.store(true, Ordering::SeqCst);
        assert!(assert_ok!(limiter.decide("ctx", "s").await).fail_open);
    }

    #[tokio::test]
    async fn test_sweep_skips_self_pruning_store() {
        let store = Arc::new(TtlStore::default());
        let limiter = Arc::new(RateLimiter::with_store(
            PolicyStore::new(PolicyTemplate::default()),
            store.clone(),
            Arc::new(SystemClock),
        ));

        assert_eq!(limiter.sweep_expired().await.unwrap(), 0);
        assert!(limiter.spawn_sweeper(Duration::from_millis(10)).is_none());
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_windows() {
        let (limiter, clock) = limiter_with_clock(PolicyTemplate::fixed_window(
            Limit::Bounded(5),
            Duration::from_millis(100),
        ));

        assert_ok!(limiter.decide("ctx", "a").await);
        assert_ok!(limiter.decide("ctx", "b").await);
        clock.advance_millis(150);
        assert_ok!(limiter.decide("ctx", "c").await);

        assert_eq!(limiter.sweep_expired().await.unwrap(), 2);
        assert!(limiter.state("ctx", "a").await.unwrap().is_none());
        assert!(limiter.state("ctx", "c").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_runs() {
        let (limiter, clock) = limiter_with_clock(PolicyTemplate::fixed_window(
            Limit::Bounded(5),
            Duration::from_millis(100),
        ));
        let limiter = Arc::new(limiter);

        assert_ok!(limiter.decide("ctx", "a").await);
        clock.advance_millis(200);

        let handle = limiter.spawn_sweeper(Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(limiter.state("ctx", "a").await.unwrap().is_none());

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_decisions_never_overrun() {
        let (limiter, _) = limiter_with_clock(PolicyTemplate::fixed_window(
            Limit::Bounded(50),
            Duration::from_secs(60),
        ));
        let limiter = Arc::new(limiter.with_lock_shards(4));

        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.decide("ctx", "hot").await.is_ok() })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 50);
    }
}
