//! Policy resolution and registration.
//!
//! The policy store maps context keys to policies. On a miss it either fails
//! with `ContextNotFound` or, if the template allows it, creates a policy
//! from the template and registers it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::policy::{Policy, PolicyConfig, PolicyTemplate};
use crate::error::{GatekeeperError, Result};

/// Concurrent store of policies keyed by context.
///
/// Every mutation of a key goes through a single map entry, so a policy
/// created from the template never replaces one registered explicitly.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: DashMap<String, Policy>,
    template: PolicyTemplate,
}

impl PolicyStore {
    /// Create a store that creates missing contexts from `template`.
    pub fn new(template: PolicyTemplate) -> Self {
        Self {
            policies: DashMap::new(),
            template,
        }
    }

    /// Create a store and register the configured policies.
    pub fn with_policies(
        template: PolicyTemplate,
        policies: impl IntoIterator<Item = PolicyConfig>,
    ) -> Result<Self> {
        let store = Self::new(template);
        for config in policies {
            store.register(Policy::from(config))?;
        }
        Ok(store)
    }

    /// Resolve the policy for a context.
    ///
    /// A policy created from the template is validated like a registered
    /// one; an invalid template fails every miss with `InvalidPolicy`.
    pub fn resolve(&self, context_key: &str) -> Result<Policy> {
        if let Some(policy) = self.policies.get(context_key) {
            return Ok(policy.clone());
        }

        if !self.template.create_if_missing {
            return Err(GatekeeperError::ContextNotFound {
                context_key: context_key.to_string(),
            });
        }

        let policy = match self.policies.entry(context_key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let policy = self.template.instantiate(context_key);
                policy.validate()?;
                debug!(
                    context = %context_key,
                    algorithm = policy.kind.algorithm(),
                    enabled = policy.enabled,
                    "Creating policy from template"
                );
                entry.insert(policy).clone()
            }
        };

        Ok(policy)
    }

    /// Register or replace the policy for its context.
    ///
    /// Takes effect on the next lookup; decisions already in flight keep the
    /// policy they resolved.
    pub fn register(&self, policy: Policy) -> Result<()> {
        policy.validate()?;

        info!(
            context = %policy.context_key,
            algorithm = policy.kind.algorithm(),
            enabled = policy.enabled,
            "Registering policy"
        );

        self.policies.insert(policy.context_key.clone(), policy);
        Ok(())
    }

    /// Remove the policy for a context, returning it if present.
    pub fn remove(&self, context_key: &str) -> Option<Policy> {
        self.policies.remove(context_key).map(|(_, policy)| policy)
    }

    /// Whether a policy is registered for the context.
    pub fn contains(&self, context_key: &str) -> bool {
        self.policies.contains_key(context_key)
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no policy is registered.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
