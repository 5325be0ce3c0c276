//! Redis-backed shared atomic store.
//!
//! Each decision is one `EVALSHA` round-trip running a Lua script, so all
//! limiter instances pointed at the same Redis agree on every key. Keys carry
//! a TTL and expire on their own.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::time::Duration;
use tracing::info;

use super::shared::{FixedWindowArgs, ScriptReply, SharedAtomicStore, TokenBucketArgs};
use crate::config::SharedStoreConfig;
use crate::error::BackendError;

/// KEYS: tokens, timestamp. ARGV: rate, capacity, now (s), requested.
/// Returns `{allowed, tokens_remaining}`. Writes only on allow.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local timestamp_key = KEYS[2]

local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local ttl = 0
if rate > 0 then
  ttl = math.max(1, math.floor(capacity / rate * 2))
end

local last_tokens = tonumber(redis.call("get", tokens_key))
if last_tokens == nil then
  last_tokens = capacity
end

local delta = 0
local last_refreshed = tonumber(redis.call("get", timestamp_key))
if last_refreshed ~= nil then
  delta = math.max(0, now - last_refreshed)
end

local filled = math.max(0, math.min(capacity, last_tokens + delta * rate))
if filled < requested then
  return { 0, math.floor(filled) }
end

local new_tokens = filled - requested
if ttl > 0 then
  redis.call("setex", tokens_key, ttl, new_tokens)
  redis.call("setex", timestamp_key, ttl, now)
else
  redis.call("set", tokens_key, new_tokens)
  redis.call("set", timestamp_key, now)
end

return { 1, math.floor(new_tokens) }
"#;

/// KEYS: counter. ARGV: limit (-1 for none), window (ms).
/// Returns `{allowed, count, pttl}`. Increments only on allow.
const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

local count = tonumber(redis.call("get", key)) or 0
if limit >= 0 and count >= limit then
  return { 0, count, redis.call("pttl", key) }
end

count = redis.call("incr", key)
if count == 1 then
  redis.call("pexpire", key, window_ms)
end

return { 1, count, redis.call("pttl", key) }
"#;

/// Shared atomic store over Redis.
pub struct RedisAtomicStore {
    connection: ConnectionManager,
    token_bucket: Script,
    fixed_window: Script,
    timeout: Duration,
}

impl fmt::Debug for RedisAtomicStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisAtomicStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisAtomicStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns `BackendError` if the client cannot be created or the
    /// connection does not come up within the configured timeout.
    pub async fn connect(config: &SharedStoreConfig) -> Result<Self, BackendError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::open(config.url.as_str())
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| BackendError::Timeout(config.timeout_ms))?
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        info!(url = %config.url, "Connected to shared store");

        Ok(Self {
            connection,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            timeout,
        })
    }

    async fn run(
        &self,
        invocation: redis::ScriptInvocation<'_>,
    ) -> Result<ScriptReply, BackendError> {
        let mut connection = self.connection.clone();
        let reply = invocation.invoke_async(&mut connection);
        let values: Vec<i64> = tokio::time::timeout(self.timeout, reply)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| match e.kind() {
                redis::ErrorKind::ResponseError | redis::ErrorKind::NoScriptError => {
                    BackendError::Script(e.to_string())
                }
                redis::ErrorKind::TypeError => BackendError::MalformedResponse(e.to_string()),
                _ => BackendError::Unavailable(e.to_string()),
            })?;

        ScriptReply::from_values(&values)
    }
}

#[async_trait]
impl SharedAtomicStore for RedisAtomicStore {
    async fn eval_atomic_token_bucket(
        &self,
        token_key: &str,
        timestamp_key: &str,
        args: TokenBucketArgs,
    ) -> Result<ScriptReply, BackendError> {
        let mut invocation = self.token_bucket.prepare_invoke();
        invocation
            .key(token_key)
            .key(timestamp_key)
            .arg(args.replenish_rate)
            .arg(args.burst_capacity)
            .arg(args.now_seconds)
            .arg(args.requested_tokens);
        self.run(invocation).await
    }

    async fn eval_atomic_fixed_window(
        &self,
        key: &str,
        args: FixedWindowArgs,
    ) -> Result<ScriptReply, BackendError> {
        let limit = args.limit.map_or(-1, |limit| limit.min(i64::MAX as u64) as i64);
        let mut invocation = self.fixed_window.prepare_invoke();
        invocation.key(key).arg(limit).arg(args.window_ms);
        self.run(invocation).await
    }
}
