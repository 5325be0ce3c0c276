//! Limiting policies and the template used to create them on demand.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Default fixed-window limit when no specific limit is configured.
const DEFAULT_LIMIT: u64 = 1000;
/// Default fixed-window duration when no specific window is configured.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// The request ceiling of a fixed window.
///
/// In configuration this is a plain integer; `-1` means [`Limit::Unlimited`].
/// An unlimited window still counts requests but never rejects on count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Limit {
    /// At most this many requests per window. `0` admits nothing.
    Bounded(u64),
    /// No numeric ceiling.
    Unlimited,
}

impl TryFrom<i64> for Limit {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(Limit::Unlimited),
            n if n >= 0 => Ok(Limit::Bounded(n as u64)),
            n => Err(format!("limit must be -1 (unlimited) or non-negative, got {}", n)),
        }
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Bounded(n) => n.min(i64::MAX as u64) as i64,
            Limit::Unlimited => -1,
        }
    }
}

/// Algorithm-specific parameters of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum PolicyKind {
    /// Count requests within a window that resets when it expires.
    FixedWindow {
        limit: Limit,
        #[serde(rename = "window_ms", with = "duration_ms")]
        window: Duration,
    },
    /// Continuously refilled bucket allowing bursts up to its capacity.
    TokenBucket {
        /// Tokens added per second
        replenish_rate: f64,
        /// Maximum number of tokens held
        burst_capacity: f64,
    },
}

impl PolicyKind {
    /// Short name of the algorithm, used in logs.
    pub fn algorithm(&self) -> &'static str {
        match self {
            PolicyKind::FixedWindow { .. } => "fixed_window",
            PolicyKind::TokenBucket { .. } => "token_bucket",
        }
    }
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::FixedWindow {
            limit: Limit::Bounded(DEFAULT_LIMIT),
            window: DEFAULT_WINDOW,
        }
    }
}

/// The resolved limiting parameters for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// The context this policy applies to
    pub context_key: String,
    /// Algorithm and its parameters
    pub kind: PolicyKind,
    /// A disabled policy rejects every request
    pub enabled: bool,
}

impl Policy {
    /// Create an enabled fixed-window policy.
    pub fn fixed_window(context_key: impl Into<String>, limit: Limit, window: Duration) -> Self {
        Self {
            context_key: context_key.into(),
            kind: PolicyKind::FixedWindow { limit, window },
            enabled: true,
        }
    }

    /// Create an enabled token-bucket policy.
    pub fn token_bucket(
        context_key: impl Into<String>,
        replenish_rate: f64,
        burst_capacity: f64,
    ) -> Self {
        Self {
            context_key: context_key.into(),
            kind: PolicyKind::TokenBucket {
                replenish_rate,
                burst_capacity,
            },
            enabled: true,
        }
    }

    /// Builder-style: set whether the policy is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate the policy parameters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| GatekeeperError::InvalidPolicy {
            context_key: self.context_key.clone(),
            reason: reason.to_string(),
        };

        if self.context_key.is_empty() {
            return Err(invalid("context key must not be empty"));
        }

        if let PolicyKind::TokenBucket {
            replenish_rate,
            burst_capacity,
        } = self.kind
        {
            if !replenish_rate.is_finite() || replenish_rate < 0.0 {
                return Err(invalid("replenish rate must be finite and non-negative"));
            }
            if !burst_capacity.is_finite() || burst_capacity < 0.0 {
                return Err(invalid("burst capacity must be finite and non-negative"));
            }
        }

        Ok(())
    }
}

/// Template used to synthesize a policy for an unknown context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    /// Parameters given to every created policy
    #[serde(flatten)]
    pub kind: PolicyKind,
    /// Create a policy on a miss instead of failing with `ContextNotFound`
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
    /// Switch applied to every created policy
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PolicyTemplate {
    fn default() -> Self {
        Self {
            kind: PolicyKind::default(),
            create_if_missing: true,
            enabled: true,
        }
    }
}

impl PolicyTemplate {
    /// A template that never creates policies.
    pub fn strict() -> Self {
        Self {
            create_if_missing: false,
            ..Self::default()
        }
    }

    /// A creating template for fixed-window policies.
    pub fn fixed_window(limit: Limit, window: Duration) -> Self {
        Self {
            kind: PolicyKind::FixedWindow { limit, window },
            ..Self::default()
        }
    }

    /// A creating template for token-bucket policies.
    pub fn token_bucket(replenish_rate: f64, burst_capacity: f64) -> Self {
        Self {
            kind: PolicyKind::TokenBucket {
                replenish_rate,
                burst_capacity,
            },
            ..Self::default()
        }
    }

    /// Builder-style: set whether missing contexts are created.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Builder-style: set whether created policies are enabled.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Build the policy for a context from this template.
    pub fn instantiate(&self, context_key: &str) -> Policy {
        Policy {
            context_key: context_key.to_string(),
            kind: self.kind.clone(),
            enabled: self.enabled,
        }
    }
}

/// An explicitly configured policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// The context key to register under
    pub context: String,
    #[serde(flatten)]
    pub kind: PolicyKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl From<PolicyConfig> for Policy {
    fn from(config: PolicyConfig) -> Self {
        Policy {
            context_key: config.context,
            kind: config.kind,
            enabled: config.enabled,
        }
    }
}

fn default_true() -> bool {
    true
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
