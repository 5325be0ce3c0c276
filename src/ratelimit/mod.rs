//! Rate limiting logic and state management.

pub mod algorithm;
mod backend;
mod clock;
mod distributed;
mod key;
mod limiter;
mod policy;
mod policy_store;
#[cfg(feature = "redis")]
mod redis_store;
mod shared;
mod state;
mod store;

pub use algorithm::{Outcome, REQUESTED_TOKENS};
pub use backend::{FailurePolicy, RateLimiterBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::DistributedRateLimiter;
pub use key::StateKey;
pub use limiter::RateLimiter;
pub use policy::{Limit, Policy, PolicyConfig, PolicyKind, PolicyTemplate};
pub use policy_store::PolicyStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisAtomicStore;
pub use shared::{
    token_bucket_ttl_seconds, FixedWindowArgs, LocalAtomicStore, ScriptReply, SharedAtomicStore,
    TokenBucketArgs,
};
pub use state::{Decision, LimitState};
pub use store::{InMemoryStateStore, StateStore};
