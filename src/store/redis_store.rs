//! Redis-backed accounting store.
//!
//! Every mutation runs as a Lua script on the server, so the
//! load / reset / increment / persist sequence for a key is a single atomic
//! step no matter how many service instances share the keyspace.
//!
//! Layout per admission key:
//! - `{prefix}win:{key}`: hash with `count`, `window_start`,
//!   `last_request_at`, `violations`, `tier`, `geo` (times in epoch millis),
//!   expiring after two windows of inactivity, or that long after the end of
//!   the key's latest block, whichever is later
//! - `{prefix}block:{key}`: string holding `blocked_until` in epoch millis,
//!   expiring when the block ends

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{duration_ms, AccountingStore, StoreError, StoreResult, WindowRequest, WindowState, WindowUpdate};
use crate::admission::{AdmissionKey, Tier};

const CHECK_AND_INCREMENT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'count', 'window_start', 'last_request_at', 'violations')
local count = tonumber(state[1]) or 0
local window_start = tonumber(state[2])
local last = tonumber(state[3]) or -1
local violations = tonumber(state[4]) or 0

if window_start == nil or now - window_start >= window_ms then
  count = 0
  window_start = now
end

local prior = count
count = count + 1
redis.call('HSET', key,
  'count', count,
  'window_start', window_start,
  'last_request_at', now,
  'violations', violations,
  'tier', ARGV[4],
  'geo', ARGV[5])
if redis.call('PTTL', key) < ttl_ms then
  redis.call('PEXPIRE', key, ttl_ms)
end

return {prior, window_start, last, violations}
"#;

const RECORD_VIOLATION: &str = r#"
local v = redis.call('HINCRBY', KEYS[1], 'violations', 1)
local ttl_ms = tonumber(ARGV[1])
if redis.call('PTTL', KEYS[1]) < ttl_ms then
  redis.call('PEXPIRE', KEYS[1], ttl_ms)
end
return v
"#;

const EXTEND_BLOCK: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1])) or 0
local until_ms = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
if until_ms > current then
  redis.call('SET', KEYS[1], until_ms, 'PX', math.max(until_ms - now, 1))
  current = until_ms
end

local keep_ms = current - now + tonumber(ARGV[3])
local pttl = redis.call('PTTL', KEYS[2])
if pttl >= 0 and pttl < keep_ms then
  redis.call('PEXPIRE', KEYS[2], keep_ms)
end
return current
"#;

const CLEAR_BLOCK: &str = r#"
redis.call('DEL', KEYS[1])
if redis.call('EXISTS', KEYS[2]) == 1 then
  redis.call('HSET', KEYS[2], 'violations', 0)
end
return 1
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/`
    pub url: String,
    /// Prefix for every key written by this store
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: "turnstile:".to_string(),
        }
    }
}

struct Scripts {
    check_and_increment: Script,
    record_violation: Script,
    extend_block: Script,
    clear_block: Script,
}

/// Shared accounting store backed by Redis.
///
/// The connection is established on first use and dropped after any
/// availability error so the next call reconnects. Constructing the store
/// never touches the network.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    config: RedisStoreConfig,
    scripts: Scripts,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store. Only the URL is validated here.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Internal(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            config,
            scripts: Scripts {
                check_and_increment: Script::new(CHECK_AND_INCREMENT),
                record_violation: Script::new(RECORD_VIOLATION),
                extend_block: Script::new(EXTEND_BLOCK),
                clear_block: Script::new(CLEAR_BLOCK),
            },
        })
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.on_error(e))?;
        info!(url = %self.config.url, "Connected to shared accounting store");

        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Map an error, forgetting the connection if the server went away.
    fn on_error(&self, err: RedisError) -> StoreError {
        let mapped = map_redis_error(err);
        if matches!(mapped, StoreError::Unavailable(_)) && self.connection.lock().take().is_some() {
            warn!(url = %self.config.url, error = %mapped, "Dropped shared store connection");
        }
        mapped
    }

    fn window_key(&self, key: &AdmissionKey) -> String {
        format!("{}win:{}", self.config.key_prefix, key)
    }

    fn block_key(&self, key: &AdmissionKey) -> String {
        format!("{}block:{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl AccountingStore for RedisStore {
    async fn load(&self, key: &AdmissionKey, now: DateTime<Utc>) -> StoreResult<Option<WindowState>> {
        let mut conn = self.connection().await?;
        let fields: (
            Option<u64>,
            Option<i64>,
            Option<i64>,
            Option<u64>,
            Option<String>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(self.window_key(key))
            .arg(&["count", "window_start", "last_request_at", "violations", "tier", "geo"])
            .query_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))?;

        let (count, window_start, last_request_at, violations, tier, geo) = fields;
        if count.is_none() && violations.is_none() {
            return Ok(None);
        }

        Ok(Some(WindowState {
            request_count: count.unwrap_or(0),
            window_start: window_start.map(from_millis).transpose()?.unwrap_or(now),
            last_request_at: last_request_at.map(from_millis).transpose()?.unwrap_or(now),
            violation_count: violations.unwrap_or(0),
            tier: tier
                .as_deref()
                .and_then(|t| t.parse().ok())
                .unwrap_or(Tier::Anonymous),
            geo: geo.filter(|g| !g.is_empty()),
        }))
    }

    async fn check_and_increment(
        &self,
        key: &AdmissionKey,
        request: &WindowRequest<'_>,
    ) -> StoreResult<WindowUpdate> {
        let mut conn = self.connection().await?;
        let (prior, window_start, last, violations): (u64, i64, i64, u64) = self
            .scripts
            .check_and_increment
            .key(self.window_key(key))
            .arg(request.now.timestamp_millis())
            .arg(duration_ms(request.window))
            .arg(duration_ms(request.ttl()).max(1))
            .arg(request.tier.as_str())
            .arg(request.geo.unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))?;

        debug!(key = %key, count = prior + 1, "Shared window incremented");

        Ok(WindowUpdate {
            admitted_count: prior + 1,
            window_start: from_millis(window_start)?,
            prior_count: prior,
            prior_request_at: if last < 0 { None } else { Some(from_millis(last)?) },
            violation_count: violations,
        })
    }

    async fn record_violation(
        &self,
        key: &AdmissionKey,
        _now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        self.scripts
            .record_violation
            .key(self.window_key(key))
            .arg(duration_ms(ttl).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))
    }

    async fn blocked_until(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut conn = self.connection().await?;
        let until: Option<i64> = redis::cmd("GET")
            .arg(self.block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))?;

        match until {
            Some(ms) => {
                let until = from_millis(ms)?;
                Ok((until > now).then_some(until))
            }
            None => Ok(None),
        }
    }

    async fn extend_block(
        &self,
        key: &AdmissionKey,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
        retain: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let mut conn = self.connection().await?;
        let effective: i64 = self
            .scripts
            .extend_block
            .key(self.block_key(key))
            .key(self.window_key(key))
            .arg(until.timestamp_millis())
            .arg(now.timestamp_millis())
            .arg(duration_ms(retain))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))?;
        from_millis(effective)
    }

    async fn clear_block(&self, key: &AdmissionKey) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = self
            .scripts
            .clear_block
            .key(self.block_key(key))
            .key(self.window_key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.on_error(e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Internal(format!("timestamp out of range: {}", ms)))
}

/// Transport failures and transient server states mean the store could not
/// serve the call and the caller should fall back. Anything else, such as a
/// script error or an undecodable reply, is an internal fault.
fn map_redis_error(err: RedisError) -> StoreError {
    let unavailable = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        );

    if unavailable {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Internal(err.to_string())
    }
}
