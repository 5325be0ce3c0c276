//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::key::StateKey;
use super::policy_store::PolicyStore;
use super::state::Decision;
use crate::error::{BackendError, Result};

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the in-process `RateLimiter` and the
/// `DistributedRateLimiter` so callers can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether the next unit of work for `subject_key` under
    /// `context_key` may proceed.
    async fn decide(&self, context_key: &str, subject_key: &str) -> Result<Decision>;

    /// The policies this limiter resolves contexts against.
    fn policies(&self) -> &PolicyStore;
}

/// What to do when the backing store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through with a degraded decision.
    FailOpen,
    /// Surface the failure as `GatekeeperError::Backend`.
    #[default]
    FailClosed,
}

impl FailurePolicy {
    /// Turn a backend failure into the configured outcome.
    ///
    /// Every backend failure in every limiter goes through here.
    pub fn on_backend_error(self, key: &StateKey, error: BackendError) -> Result<Decision> {
        match self {
            FailurePolicy::FailOpen => {
                warn!(key = %key, error = %error, "Backend failed, allowing request");
                Ok(Decision::failed_open())
            }
            FailurePolicy::FailClosed => {
                warn!(key = %key, error = %error, "Backend failed, rejecting request");
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatekeeperError;

    #[test]
    fn test_fail_open_allows() {
        let key = StateKey::new("ctx", "user");
        let decision = FailurePolicy::FailOpen
            .on_backend_error(&key, BackendError::Timeout(50))
            .unwrap();

        assert!(decision.fail_open);
        assert!(decision.state.is_none());
    }

    #[test]
    fn test_fail_closed_propagates() {
        let key = StateKey::new("ctx", "user");
        let err = FailurePolicy::FailClosed
            .on_backend_error(&key, BackendError::Unavailable("down".into()))
            .unwrap_err();

        assert!(matches!(
            err,
            GatekeeperError::Backend(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn test_default_is_fail_closed() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailClosed);
        let parsed: FailurePolicy = serde_yaml::from_str("fail_open").unwrap();
        assert_eq!(parsed, FailurePolicy::FailOpen);
    }
}
