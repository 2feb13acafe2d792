//! Process-local accounting store.
//!
//! Used when no shared store is configured and as the fallback when the
//! shared store is unreachable. Per-key atomicity comes from the `DashMap`
//! shard lock held by an entry guard for the whole read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{
    add_duration, window_expired, AccountingStore, StoreResult, WindowRequest, WindowState,
    WindowUpdate,
};
use crate::admission::{AdmissionKey, Tier};

/// Default number of keys kept before eviction starts.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct LocalEntry {
    count: u64,
    window_start: Option<DateTime<Utc>>,
    last_request_at: Option<DateTime<Utc>>,
    violations: u64,
    tier: Tier,
    geo: Option<String>,
    expires_at: DateTime<Utc>,
}

impl LocalEntry {
    fn empty(tier: Tier, expires_at: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: None,
            last_request_at: None,
            violations: 0,
            tier,
            geo: None,
            expires_at,
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Recency used for eviction ordering.
    fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_request_at.or(self.window_start)
    }

    fn to_state(&self, now: DateTime<Utc>) -> WindowState {
        WindowState {
            request_count: self.count,
            window_start: self.window_start.unwrap_or(now),
            last_request_at: self.last_request_at.unwrap_or(now),
            violation_count: self.violations,
            tier: self.tier,
            geo: self.geo.clone(),
        }
    }
}

/// Bounded in-memory store.
pub struct LocalStore {
    windows: DashMap<AdmissionKey, LocalEntry>,
    blocks: DashMap<AdmissionKey, DateTime<Utc>>,
    capacity: usize,
    eviction: Mutex<()>,
}

impl LocalStore {
    /// Create a store that keeps at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: DashMap::new(),
            blocks: DashMap::new(),
            capacity: capacity.max(1),
            eviction: Mutex::new(()),
        }
    }

    /// Number of keys with window state.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Number of keys with a block entry, lapsed or not.
    pub fn blocked_len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop expired window state and lapsed blocks. Returns how many entries
    /// were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len() + self.blocks.len();
        self.windows.retain(|_, entry| !entry.expired(now));
        self.blocks.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.windows.len() + self.blocks.len());
        if removed > 0 {
            debug!(removed, "Purged expired local admission state");
        }
        removed
    }

    /// Evict the least recently seen keys until the store is within capacity.
    fn enforce_capacity(&self) {
        if self.windows.len() <= self.capacity {
            return;
        }
        // One evictor at a time; others carry on and let it catch up.
        let Some(_guard) = self.eviction.try_lock() else {
            return;
        };

        let excess = self.windows.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(Option<DateTime<Utc>>, AdmissionKey)> = self
            .windows
            .iter()
            .map(|entry| (entry.value().last_seen(), entry.key().clone()))
            .collect();
        by_age.sort_unstable();

        for (_, key) in by_age.into_iter().take(excess) {
            self.windows.remove(&key);
        }
        debug!(evicted = excess, capacity = self.capacity, "Evicted local admission state");
    }

    /// Keep the block table within capacity: lapsed blocks go first, then
    /// the ones closest to ending.
    fn enforce_block_capacity(&self, now: DateTime<Utc>) {
        if self.blocks.len() <= self.capacity {
            return;
        }
        let Some(_guard) = self.eviction.try_lock() else {
            return;
        };

        self.blocks.retain(|_, until| *until > now);
        let excess = self.blocks.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }

        let mut by_end: Vec<(DateTime<Utc>, AdmissionKey)> = self
            .blocks
            .iter()
            .map(|entry| (*entry.value(), entry.key().clone()))
            .collect();
        by_end.sort_unstable();

        for (_, key) in by_end.into_iter().take(excess) {
            self.blocks.remove(&key);
        }
        warn!(evicted = excess, capacity = self.capacity, "Evicted local blocks over capacity");
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl AccountingStore for LocalStore {
    async fn load(&self, key: &AdmissionKey, now: DateTime<Utc>) -> StoreResult<Option<WindowState>> {
        Ok(self
            .windows
            .get(key)
            .filter(|entry| !entry.expired(now))
            .map(|entry| entry.to_state(now)))
    }

    async fn check_and_increment(
        &self,
        key: &AdmissionKey,
        request: &WindowRequest<'_>,
    ) -> StoreResult<WindowUpdate> {
        let now = request.now;
        let expires_at = add_duration(now, request.ttl());

        let update = {
            let mut guard = self
                .windows
                .entry(key.clone())
                .or_insert_with(|| LocalEntry::empty(request.tier, expires_at));
            let entry = guard.value_mut();

            if entry.expired(now) {
                *entry = LocalEntry::empty(request.tier, expires_at);
            }

            let window_start = match entry.window_start {
                Some(start) if !window_expired(start, now, request.window) => start,
                _ => {
                    entry.count = 0;
                    now
                }
            };

            let prior_count = entry.count;
            let prior_request_at = entry.last_request_at;

            entry.count += 1;
            entry.window_start = Some(window_start);
            entry.last_request_at = Some(now);
            entry.tier = request.tier;
            entry.geo = request.geo.map(str::to_string);
            entry.expires_at = entry.expires_at.max(expires_at);

            WindowUpdate {
                admitted_count: entry.count,
                window_start,
                prior_count,
                prior_request_at,
                violation_count: entry.violations,
            }
        };

        trace!(key = %key, count = update.admitted_count, "Local window incremented");
        self.enforce_capacity();
        Ok(update)
    }

    async fn record_violation(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<u64> {
        let expires_at = add_duration(now, ttl);
        let violations = {
            let mut guard = self
                .windows
                .entry(key.clone())
                .or_insert_with(|| LocalEntry::empty(Tier::Anonymous, expires_at));
            let entry = guard.value_mut();
            if entry.expired(now) {
                *entry = LocalEntry::empty(entry.tier, expires_at);
            }
            entry.violations += 1;
            entry.expires_at = entry.expires_at.max(expires_at);
            entry.violations
        };

        self.enforce_capacity();
        Ok(violations)
    }

    async fn blocked_until(
        &self,
        key: &AdmissionKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.blocks.remove_if(key, |_, until| *until <= now);
        Ok(self.blocks.get(key).map(|until| *until))
    }

    async fn extend_block(
        &self,
        key: &AdmissionKey,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
        retain: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let effective = {
            let mut current = self.blocks.entry(key.clone()).or_insert(until);
            if until > *current {
                *current = until;
            }
            *current
        };

        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.expires_at = entry.expires_at.max(add_duration(effective, retain));
        }

        self.enforce_block_capacity(now);
        Ok(effective)
    }

    async fn clear_block(&self, key: &AdmissionKey) -> StoreResult<()> {
        self.blocks.remove(key);
        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.violations = 0;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
