//! Error types for Gatekeeper.

use thiserror::Error;

use crate::ratelimit::{LimitState, Policy};

/// Main error type for Gatekeeper operations.
///
/// `ContextNotFound` and `LimitExceeded` are ordinary outcomes of a
/// decision; callers are expected to branch on them. `Backend` is the
/// exceptional case and is only surfaced when the limiter is configured to
/// fail closed.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// No policy is registered for the context and creation is disabled.
    #[error("Rate limit context not found: {context_key}")]
    ContextNotFound { context_key: String },

    /// The limiting algorithm rejected the request.
    #[error("Rate limit exceeded for context {}", policy.context_key)]
    LimitExceeded {
        /// The policy that was applied.
        policy: Policy,
        /// The state that caused the rejection, when one exists.
        state: Option<LimitState>,
    },

    /// The state store or shared atomic store failed.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A policy failed validation.
    #[error("Invalid policy for context {context_key}: {reason}")]
    InvalidPolicy { context_key: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error is a rejection by the limiting algorithm.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, GatekeeperError::LimitExceeded { .. })
    }
}

/// Failure of a state store or shared atomic store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The store could not be reached or the round-trip failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something we could not interpret.
    #[error("malformed store response: {0}")]
    MalformedResponse(String),

    /// The server-side script failed.
    #[error("script failed: {0}")]
    Script(String),

    /// The round-trip did not complete in time.
    #[error("store timed out after {0}ms")]
    Timeout(u64),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
