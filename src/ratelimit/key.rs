//! State key generation and handling.

/// A key that uniquely identifies one piece of limit state.
///
/// The key is composed of the context (the policy name) and the subject
/// being limited under that context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    /// The context this state belongs to
    pub context: String,
    /// The subject being limited, e.g. a user id or route
    pub subject: String,
}

impl StateKey {
    /// Create a new state key from a context and subject.
    pub fn new(context: &str, subject: &str) -> Self {
        Self {
            context: context.to_string(),
            subject: subject.to_string(),
        }
    }

    /// Convert the state key to a string representation.
    ///
    /// The subject is wrapped in braces so that every key derived from it
    /// hashes to the same slot on a clustered shared store.
    pub fn to_string_key(&self) -> String {
        format!("{}.{{{}}}", self.context, self.subject)
    }

    /// Keys used by the token-bucket script: `(tokens, timestamp)`.
    pub fn token_bucket_keys(&self, prefix: &str) -> (String, String) {
        let base = self.to_string_key();
        (
            format!("{}{}.tokens", prefix, base),
            format!("{}{}.timestamp", prefix, base),
        )
    }

    /// Key used by the fixed-window script.
    pub fn fixed_window_key(&self, prefix: &str) -> String {
        format!("{}{}.count", prefix, self.to_string_key())
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
