//! Primary-with-local-fallback store strategy.
//!
//! Every call goes to the shared store first, bounded by a timeout. When the
//! shared store is unreachable or too slow the call is served from the
//! process-local store instead, and the shared store is skipped for a
//! cooldown period before it is tried again. Admission keeps working with
//! per-process accounting in the meantime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{AccountingStore, LocalStore, StoreError, StoreResult, WindowRequest, WindowState, WindowUpdate};
use crate::admission::AdmissionKey;

/// Default bound on a single shared store round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(25);
/// Default time the shared store is skipped after a failure.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Routes calls to a primary store, degrading to a local one.
pub struct FallbackStore {
    primary: Arc<dyn AccountingStore>,
    local: Arc<LocalStore>,
    timeout: Duration,
    cooldown: Duration,
    /// Nanoseconds since `epoch` of the last primary failure; 0 while healthy
    failed_at_nanos: AtomicU64,
    epoch: Instant,
    fallbacks: AtomicU64,
}

impl FallbackStore {
    pub fn new(
        primary: Arc<dyn AccountingStore>,
        local: Arc<LocalStore>,
        timeout: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            primary,
            local,
            timeout,
            cooldown,
            failed_at_nanos: AtomicU64::new(0),
            epoch: Instant::now(),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// The local store calls degrade to.
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Whether the primary is currently being bypassed.
    pub fn is_degraded(&self) -> bool {
        self.failed_at_nanos.load(Ordering::Acquire) != 0
    }

    /// Number of calls served by the local store so far.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn elapsed_nanos(&self) -> u64 {
        // Never 0, so 0 can mean "healthy".
        (self.epoch.elapsed().as_nanos() as u64).max(1)
    }

    fn primary_available(&self) -> bool {
        match self.failed_at_nanos.load(Ordering::Acquire) {
            0 => true,
            failed_at => {
                let since = Duration::from_nanos(self.elapsed_nanos().saturating_sub(failed_at));
                since >= self.cooldown
            }
        }
    }

    fn mark_unhealthy(&self, op: &'static str, reason: &str) {
        let previous = self
            .failed_at_nanos
            .swap(self.elapsed_nanos(), Ordering::AcqRel);
        if previous == 0 {
            warn!(
                store = self.primary.name(),
                op,
                reason,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Shared accounting store unavailable, falling back to local accounting"
            );
        } else {
            debug!(store = self.primary.name(), op, reason, "Shared accounting store still unavailable");
        }
    }

    fn mark_healthy(&self) {
        if self.failed_at_nanos.swap(0, Ordering::AcqRel) != 0 {
            info!(store = self.primary.name(), "Shared accounting store recovered");
        }
    }

    async fn route<T, P, L>(&self, op: &'static str, primary: P, local: L) -> StoreResult<T>
    where
        P: Future<Output = StoreResult<T>>,
        L: Future<Output = StoreResult<T>>,
    {
        if self.primary_available() {
            match tokio::time::timeout(self.timeout, primary).await {
                Ok(Ok(value)) => {
                    self.mark_healthy();
                    return Ok(value);
                }
                Ok(Err(StoreError::Unavailable(reason))) => self.mark_unhealthy(op, &reason),
                Ok(Err(err)) => return Err(err),
                Err(_) => self.mark_unhealthy(op, "timed out"),
            }
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        local.await
    }
}

#[async_trait]
impl AccountingStore for FallbackStore {
    async fn load(&self, key: &AdmissionKey, now: DateTime<Utc>) -> StoreResult<Option<WindowState>> {
        self.route("load", self.primary.load(key, now), self.local.load(key, now))
            .await
    }

    async fn check_and_increment(
        &self,
        key: &AdmissionKey,
        request: &WindowRequest<'_>,
    ) -> StoreResult<WindowUpdate> {
        self.route(
            "check_and_increment",
            self.primary.check_and_increment(key, request),
            self.local.check_and_increment(key, request),
        )
        .await
    }

    async fn record_violation(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<u64> {
        self.route(
            "record_violation",
            self.primary.record_violation(key, now, ttl),
            self.local.record_violation(key, now, ttl),
        )
        .await
    }

    async fn blocked_until(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.route(
            "blocked_until",
            self.primary.blocked_until(key, now),
            self.local.blocked_until(key, now),
        )
        .await
    }

    async fn extend_block(
        &self,
        key: &AdmissionKey,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
        retain: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        self.route(
            "extend_block",
            self.primary.extend_block(key, until, now, retain),
            self.local.extend_block(key, until, now, retain),
        )
        .await
    }

    async fn clear_block(&self, key: &AdmissionKey) -> StoreResult<()> {
        // Clear both sides so a block recorded during an outage goes too.
        let local = self.local.clear_block(key).await;
        self.route("clear_block", self.primary.clear_block(key), async { local })
            .await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}
