//! Window accounting stores.
//!
//! All mutable admission state lives behind [`AccountingStore`]. Two
//! implementations exist, a shared Redis store and a bounded process-local
//! cache, combined at runtime by [`FallbackStore`].

mod fallback;
mod local;
mod redis_store;

pub use fallback::FallbackStore;
pub use local::LocalStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::admission::{AdmissionKey, Tier};

/// Errors returned by accounting stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached in time. Callers degrade to local state.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something that makes no sense.
    #[error("store internal error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Per-key accounting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    /// Requests counted since `window_start`
    pub request_count: u64,
    pub window_start: DateTime<Utc>,
    pub last_request_at: DateTime<Utc>,
    /// Denials recorded for this key; survives window resets
    pub violation_count: u64,
    pub tier: Tier,
    pub geo: Option<String>,
}

impl WindowState {
    /// The state as it should be read at `now`: an expired window counts zero
    /// requests and starts at `now`.
    pub fn as_of(&self, now: DateTime<Utc>, window: Duration) -> WindowState {
        if window_expired(self.window_start, now, window) {
            WindowState {
                request_count: 0,
                window_start: now,
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}

/// Parameters of a check-and-increment call.
#[derive(Debug, Clone)]
pub struct WindowRequest<'a> {
    pub tier: Tier,
    pub geo: Option<&'a str>,
    pub limit: u64,
    pub window: Duration,
    pub now: DateTime<Utc>,
}

impl WindowRequest<'_> {
    /// Inactivity TTL for the stored state.
    pub fn ttl(&self) -> Duration {
        state_ttl(self.window)
    }
}

/// Outcome of an atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Count after this request was added
    pub admitted_count: u64,
    pub window_start: DateTime<Utc>,
    /// Count immediately before the increment, after any window reset
    pub prior_count: u64,
    /// Previous request time; `None` for a brand new key
    pub prior_request_at: Option<DateTime<Utc>>,
    pub violation_count: u64,
}

impl WindowUpdate {
    /// Whether the request fits under `limit`.
    pub fn within(&self, limit: u64) -> bool {
        self.admitted_count <= limit
    }
}

/// Storage for window counters and blocklist entries.
///
/// Every mutating operation must be atomic per key: two concurrent
/// `check_and_increment` calls never observe the same prior count.
#[async_trait]
pub trait AccountingStore: Send + Sync {
    /// Read the current state of a key, if any.
    async fn load(&self, key: &AdmissionKey, now: DateTime<Utc>) -> StoreResult<Option<WindowState>>;

    /// Reset the window if expired, count this request, and persist.
    async fn check_and_increment(
        &self,
        key: &AdmissionKey,
        request: &WindowRequest<'_>,
    ) -> StoreResult<WindowUpdate>;

    /// Add one violation and return the new total.
    async fn record_violation(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<u64>;

    /// When the key's block ends, if it has one that has not yet expired.
    async fn blocked_until(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Move the block end forward to `until`. Never shortens an existing block.
    /// The key's violation history is kept until at least `until + retain`.
    /// Returns the block end now in effect.
    async fn extend_block(
        &self,
        key: &AdmissionKey,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
        retain: Duration,
    ) -> StoreResult<DateTime<Utc>>;

    /// Remove a block and reset the key's violation history.
    async fn clear_block(&self, key: &AdmissionKey) -> StoreResult<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Inactivity TTL: two windows.
pub fn state_ttl(window: Duration) -> Duration {
    window.saturating_mul(2)
}

pub(crate) fn window_expired(start: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    (now - start).num_milliseconds() >= duration_ms(window)
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::try_milliseconds(duration_ms(d))
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store doubles shared by tests across the crate.

    use super::*;

    /// A store that fails every call with the configured error.
    pub struct FailingStore(pub StoreError);

    #[async_trait]
    impl AccountingStore for FailingStore {
        async fn load(&self, _: &AdmissionKey, _: DateTime<Utc>) -> StoreResult<Option<WindowState>> {
            Err(self.0.clone())
        }

        async fn check_and_increment(
            &self,
            _: &AdmissionKey,
            _: &WindowRequest<'_>,
        ) -> StoreResult<WindowUpdate> {
            Err(self.0.clone())
        }

        async fn record_violation(&self, _: &AdmissionKey, _: DateTime<Utc>, _: Duration) -> StoreResult<u64> {
            Err(self.0.clone())
        }

        async fn blocked_until(
            &self,
            _: &AdmissionKey,
            _: DateTime<Utc>,
        ) -> StoreResult<Option<DateTime<Utc>>> {
            Err(self.0.clone())
        }

        async fn extend_block(
            &self,
            _: &AdmissionKey,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Duration,
        ) -> StoreResult<DateTime<Utc>> {
            Err(self.0.clone())
        }

        async fn clear_block(&self, _: &AdmissionKey) -> StoreResult<()> {
            Err(self.0.clone())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }
}
