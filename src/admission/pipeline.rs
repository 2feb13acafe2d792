//! The admission decision pipeline.
//!
//! One call to [`AdmissionPipeline::check_admission`] resolves the key, checks
//! the blocklist, computes the effective limit, counts the request atomically,
//! checks for bursts, and returns the decision. It never fails: when the
//! decision cannot be computed the request is admitted and the error logged.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, trace};

use super::adaptive::{AdaptiveAdjuster, AdaptiveConfig};
use super::blocklist::{BlocklistManager, ViolationConfig};
use super::burst::{BurstConfig, BurstGuard};
use super::decision::{seconds_until, AdmissionContext, AdmissionDecision, DecisionReason};
use super::events::{AdmissionEvent, EventEmitter, ObservabilityConfig};
use super::key::{AdmissionKey, KeyResolver, ResolvedKey};
use super::registry::{LimitsConfig, TierRegistry};
use crate::store::{add_duration, AccountingStore, StoreResult, WindowRequest};

/// Settings for every pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub burst: BurstConfig,
    #[serde(default)]
    pub violations: ViolationConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Point-in-time copy of the decision counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionStats {
    pub admitted: u64,
    pub limited: u64,
    pub burst: u64,
    pub blocked: u64,
    pub degraded: u64,
}

#[derive(Default)]
struct DecisionCounters {
    admitted: AtomicU64,
    limited: AtomicU64,
    burst: AtomicU64,
    blocked: AtomicU64,
    degraded: AtomicU64,
}

impl DecisionCounters {
    fn record(&self, reason: DecisionReason) {
        let counter = match reason {
            DecisionReason::Admitted => &self.admitted,
            DecisionReason::LimitExceeded => &self.limited,
            DecisionReason::Burst => &self.burst,
            DecisionReason::Blocked => &self.blocked,
            DecisionReason::Degraded => &self.degraded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DecisionStats {
        DecisionStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            limited: self.limited.load(Ordering::Relaxed),
            burst: self.burst.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Admission control over a shared accounting store.
///
/// The pipeline is `Send + Sync` and is meant to be shared behind an `Arc`
/// by every request handler.
pub struct AdmissionPipeline {
    resolver: KeyResolver,
    registry: RwLock<Arc<TierRegistry>>,
    store: Arc<dyn AccountingStore>,
    blocklist: BlocklistManager,
    adjuster: AdaptiveAdjuster,
    burst: BurstGuard,
    events: EventEmitter,
    counters: DecisionCounters,
}

impl AdmissionPipeline {
    /// Create a pipeline with its settings taken from `config`.
    pub fn new(store: Arc<dyn AccountingStore>, config: &PipelineConfig) -> Self {
        Self::with_burst_guard(store, config, BurstGuard::new(&config.burst))
    }

    /// Create a pipeline with a caller-supplied burst guard.
    pub fn with_burst_guard(
        store: Arc<dyn AccountingStore>,
        config: &PipelineConfig,
        burst: BurstGuard,
    ) -> Self {
        Self {
            resolver: KeyResolver::new(),
            registry: RwLock::new(Arc::new(TierRegistry::new(config.limits.clone()))),
            blocklist: BlocklistManager::new(store.clone(), &config.violations),
            store,
            adjuster: AdaptiveAdjuster::new(&config.adaptive),
            burst,
            events: EventEmitter::new(&config.observability),
            counters: DecisionCounters::default(),
        }
    }

    /// Swap in a new set of limits. In-flight decisions finish on the old one.
    pub fn set_registry(&self, registry: TierRegistry) {
        *self.registry.write() = Arc::new(registry);
    }

    /// The limits currently in effect.
    pub fn registry(&self) -> Arc<TierRegistry> {
        self.registry.read().clone()
    }

    /// Decide whether one request may proceed.
    pub async fn check_admission(&self, ctx: &AdmissionContext) -> AdmissionDecision {
        let resolved = self.resolver.resolve_or_fallback(
            &ctx.subject,
            ctx.tier,
            &ctx.endpoint_id,
            ctx.geo.as_deref(),
        );
        if resolved.fallback {
            debug!(
                key = %resolved.key,
                endpoint = %resolved.endpoint_id,
                tier = %resolved.tier,
                "Using fallback admission key"
            );
        }

        let (decision, escalated) = match self.decide(ctx, &resolved).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    key = %resolved.key,
                    store = self.store.name(),
                    error = %e,
                    "Admission decision failed, admitting request"
                );
                (self.degraded(ctx, &resolved), false)
            }
        };

        self.counters.record(decision.reason);
        self.events.emit(AdmissionEvent::from_decision(
            &decision,
            &resolved.endpoint_id,
            ctx.timestamp,
            escalated,
        ));
        decision
    }

    async fn decide(
        &self,
        ctx: &AdmissionContext,
        resolved: &ResolvedKey,
    ) -> StoreResult<(AdmissionDecision, bool)> {
        let now = ctx.timestamp;
        let key = &resolved.key;
        let base = self
            .registry()
            .resolve_effective_limit(resolved.tier, &resolved.endpoint_id);
        let window = base.window();

        let status = self.blocklist.is_blocked(key, now).await?;
        if let (true, Some(until)) = (status.blocked, status.blocked_until) {
            trace!(key = %key, blocked_until = %until, "Blocked key short-circuited");
            let decision = AdmissionDecision {
                allowed: false,
                remaining: 0,
                reset_at: until,
                retry_after_seconds: Some(seconds_until(now, until)),
                blocked: true,
                effective_limit: base.max_requests,
                tier: resolved.tier,
                key: key.clone(),
                reason: DecisionReason::Blocked,
            };
            return Ok((decision, false));
        }

        let limit = match self.store.load(key, now).await? {
            Some(state) => self
                .adjuster
                .adjust(base.max_requests, &state.as_of(now, window)),
            None => base.max_requests,
        };
        if limit < base.max_requests {
            debug!(
                key = %key,
                configured = base.max_requests,
                adjusted = limit,
                "Limit reduced for repeat violator"
            );
        }

        let request = WindowRequest {
            tier: resolved.tier,
            geo: ctx.geo.as_deref(),
            limit,
            window,
            now,
        };
        let update = self.store.check_and_increment(key, &request).await?;
        let reset_at = add_duration(update.window_start, window);

        let mut decision = AdmissionDecision {
            allowed: true,
            remaining: limit.saturating_sub(update.admitted_count),
            reset_at,
            retry_after_seconds: None,
            blocked: false,
            effective_limit: limit,
            tier: resolved.tier,
            key: key.clone(),
            reason: DecisionReason::Admitted,
        };

        let (reason, retry_after) = if !update.within(limit) {
            debug!(
                key = %key,
                count = update.admitted_count,
                limit = limit,
                "Admission limit exceeded"
            );
            (DecisionReason::LimitExceeded, seconds_until(now, reset_at))
        } else if self.burst.is_burst_violation(&update, now) {
            debug!(key = %key, count = update.prior_count, "Burst detected");
            (DecisionReason::Burst, self.burst.retry_after_secs())
        } else {
            return Ok((decision, false));
        };

        let outcome = self
            .blocklist
            .record_violation(key, now, request.ttl())
            .await?;
        decision.allowed = false;
        decision.reason = reason;
        decision.retry_after_seconds = Some(retry_after);
        if reason == DecisionReason::LimitExceeded {
            decision.remaining = 0;
        }

        if let Some(until) = outcome.blocked_until {
            decision.blocked = true;
            decision.retry_after_seconds = Some(retry_after.max(seconds_until(now, until)));
        }
        Ok((decision, outcome.blocked_until.is_some()))
    }

    fn degraded(&self, ctx: &AdmissionContext, resolved: &ResolvedKey) -> AdmissionDecision {
        let limit = self
            .registry()
            .resolve_effective_limit(resolved.tier, &resolved.endpoint_id);
        AdmissionDecision {
            allowed: true,
            remaining: 0,
            reset_at: add_duration(ctx.timestamp, limit.window()),
            retry_after_seconds: None,
            blocked: false,
            effective_limit: limit.max_requests,
            tier: resolved.tier,
            key: resolved.key.clone(),
            reason: DecisionReason::Degraded,
        }
    }

    /// Operator clear of a key's block and violation history.
    pub async fn unblock(&self, key: &AdmissionKey) -> StoreResult<()> {
        self.blocklist.unblock(key).await
    }

    /// Decision counters since start.
    pub fn stats(&self) -> DecisionStats {
        self.counters.snapshot()
    }

    /// Stream of admission events emitted from now on.
    pub fn subscribe(&self) -> BroadcastStream<AdmissionEvent> {
        self.events.subscribe()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{SubjectIdentity, Tier, TierLimit};
    use crate::store::testing::FailingStore;
    use crate::store::{FallbackStore, LocalStore, RedisStore, RedisStoreConfig, StoreError};
    use chrono::{DateTime, TimeZone, Utc};
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::time::Duration;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn config_with(tier: Tier, limit: TierLimit) -> PipelineConfig {
        let mut tiers = HashMap::new();
        tiers.insert(tier, limit);
        PipelineConfig {
            limits: LimitsConfig {
                tiers,
                endpoints: HashMap::new(),
            },
            burst: BurstConfig {
                jitter_seed: Some(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pipeline(config: &PipelineConfig) -> AdmissionPipeline {
        AdmissionPipeline::new(Arc::new(LocalStore::default()), config)
    }

    fn ctx(user: &str, tier: Tier, ms: i64) -> AdmissionContext {
        AdmissionContext::new(SubjectIdentity::user(user), tier, "GET /v1/items").at(at(ms))
    }

    #[tokio::test]
    async fn test_remaining_counts_down_then_denies() {
        let config = config_with(Tier::Authenticated, TierLimit::new(5, 60));
        let pipeline = pipeline(&config);

        let mut remaining = Vec::new();
        for i in 0..5 {
            let decision = pipeline.check_admission(&ctx("u-1", Tier::Authenticated, i * 200)).await;
            assert!(decision.allowed);
            assert_eq!(decision.effective_limit, 5);
            remaining.push(decision.remaining);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = pipeline.check_admission(&ctx("u-1", Tier::Authenticated, 1_000)).await;
        assert!(!denied.allowed);
        assert!(!denied.blocked);
        assert_eq!(denied.reason, DecisionReason::LimitExceeded);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_seconds, Some(59));
        assert_eq!(denied.reset_at, at(60_000));
    }

    #[tokio::test]
    async fn test_rapid_requests_trip_burst_guard_under_ceiling() {
        let config = PipelineConfig {
            burst: BurstConfig {
                min_interval_ms: 100,
                burst_limit: 10,
                jitter_seed: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };
        let pipeline = pipeline(&config);

        for i in 0..10 {
            let decision = pipeline.check_admission(&ctx("u-2", Tier::Authenticated, i * 5)).await;
            assert!(decision.allowed, "request {} should pass", i + 1);
        }

        let denied = pipeline.check_admission(&ctx("u-2", Tier::Authenticated, 50)).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, DecisionReason::Burst);
        assert_eq!(denied.effective_limit, 100);
        let retry = denied.retry_after_seconds.unwrap();
        assert!((1..=3).contains(&retry));
    }

    #[tokio::test]
    async fn test_burst_retry_uses_injected_jitter() {
        struct Fixed;
        impl crate::admission::JitterSource for Fixed {
            fn jitter(&self, _max: u64) -> u64 {
                2
            }
        }

        let config = PipelineConfig {
            burst: BurstConfig {
                burst_limit: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let guard = BurstGuard::with_jitter(&config.burst, Box::new(Fixed));
        let pipeline =
            AdmissionPipeline::with_burst_guard(Arc::new(LocalStore::default()), &config, guard);

        pipeline.check_admission(&ctx("u-3", Tier::Premium, 0)).await;
        let denied = pipeline.check_admission(&ctx("u-3", Tier::Premium, 1)).await;
        assert_eq!(denied.reason, DecisionReason::Burst);
        assert_eq!(denied.retry_after_seconds, Some(3));
    }

    #[tokio::test]
    async fn test_higher_tiers_get_higher_limits() {
        let pipeline = pipeline(&PipelineConfig::default());

        let mut limits = Vec::new();
        for tier in Tier::ALL {
            let decision = pipeline.check_admission(&ctx("same-user", tier, 0)).await;
            limits.push(decision.effective_limit);
        }
        assert!(limits.windows(2).all(|w| w[0] <= w[1]), "{:?}", limits);
        assert_eq!(limits, vec![30, 100, 500, 2000, 10000]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_admit_exactly_limit() {
        let mut config = config_with(Tier::Authenticated, TierLimit::new(20, 60));
        config.burst.burst_limit = u64::MAX;
        let pipeline = Arc::new(pipeline(&config));

        let handles: Vec<_> = (0..60)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    pipeline
                        .check_admission(&ctx("racer", Tier::Authenticated, 0))
                        .await
                        .allowed
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
        assert_eq!(pipeline.stats().admitted, 20);
    }

    #[tokio::test]
    async fn test_window_reset_restores_full_quota() {
        let config = config_with(Tier::Authenticated, TierLimit::new(3, 60));
        let pipeline = pipeline(&config);

        for i in 0..4 {
            pipeline.check_admission(&ctx("u-4", Tier::Authenticated, i * 500)).await;
        }

        let fresh = pipeline.check_admission(&ctx("u-4", Tier::Authenticated, 61_000)).await;
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
        assert_eq!(fresh.reset_at, at(121_000));
    }

    #[tokio::test]
    async fn test_repeat_violations_escalate_to_block() {
        let config = config_with(Tier::Authenticated, TierLimit::new(1, 60));
        let pipeline = pipeline(&config);

        pipeline.check_admission(&ctx("u-5", Tier::Authenticated, 0)).await;
        for i in 1..=2 {
            let d = pipeline.check_admission(&ctx("u-5", Tier::Authenticated, i * 1_000)).await;
            assert_eq!(d.reason, DecisionReason::LimitExceeded);
            assert!(!d.blocked);
        }

        let escalated = pipeline.check_admission(&ctx("u-5", Tier::Authenticated, 3_000)).await;
        assert_eq!(escalated.reason, DecisionReason::LimitExceeded);
        assert!(escalated.blocked);
        assert_eq!(escalated.retry_after_seconds, Some(60));

        // Short-circuited while blocked, even in a new window.
        let blocked = pipeline.check_admission(&ctx("u-5", Tier::Authenticated, 62_000)).await;
        assert!(!blocked.allowed);
        assert!(blocked.blocked);
        assert_eq!(blocked.reason, DecisionReason::Blocked);
        assert_eq!(blocked.retry_after_seconds, Some(1));

        let stats = pipeline.stats();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.limited, 3);
        assert_eq!(stats.blocked, 1);
    }

    #[tokio::test]
    async fn test_offences_after_each_block_keep_escalating() {
        let config = PipelineConfig {
            violations: ViolationConfig::default(),
            ..config_with(Tier::Authenticated, TierLimit::new(1, 60))
        };
        let pipeline = pipeline(&config);

        // Offend once a second; when blocked, come back exactly as the block ends.
        let mut now = at(0);
        let mut block_secs = Vec::new();
        for _ in 0..40 {
            let ctx = AdmissionContext::new(
                SubjectIdentity::user("u-9"),
                Tier::Authenticated,
                "GET /v1/items",
            )
            .at(now);
            let decision = pipeline.check_admission(&ctx).await;

            if decision.reason == DecisionReason::Blocked {
                now = decision.reset_at;
                continue;
            }
            if decision.blocked {
                block_secs.push(decision.retry_after_seconds.unwrap());
                if block_secs.len() == 4 {
                    break;
                }
            }
            now += chrono::Duration::seconds(1);
        }

        assert_eq!(block_secs, vec![60, 120, 240, 480]);
    }

    #[tokio::test]
    async fn test_unblock_lifts_block() {
        let config = config_with(Tier::Authenticated, TierLimit::new(1, 60));
        let pipeline = pipeline(&config);

        let mut last = None;
        for i in 0..4 {
            last = Some(pipeline.check_admission(&ctx("u-6", Tier::Authenticated, i)).await);
        }
        let key = last.unwrap().key;
        assert!(pipeline.check_admission(&ctx("u-6", Tier::Authenticated, 10)).await.blocked);

        pipeline.unblock(&key).await.unwrap();

        let after = pipeline.check_admission(&ctx("u-6", Tier::Authenticated, 20)).await;
        assert_eq!(after.reason, DecisionReason::LimitExceeded);
        assert!(!after.blocked);
    }

    #[tokio::test]
    async fn test_repeat_violator_limit_is_reduced() {
        let config = PipelineConfig {
            violations: ViolationConfig {
                escalation_threshold: 1_000,
                ..Default::default()
            },
            ..config_with(Tier::Authenticated, TierLimit::new(4, 60))
        };
        let pipeline = pipeline(&config);

        // 4 admitted, then enough denials to push violations past 80% of requests.
        for i in 0..30 {
            pipeline.check_admission(&ctx("u-7", Tier::Authenticated, i * 200)).await;
        }

        let next = pipeline.check_admission(&ctx("u-7", Tier::Authenticated, 6_500)).await;
        assert_eq!(next.effective_limit, 2);
    }

    #[tokio::test]
    async fn test_internal_store_error_fails_open() {
        let pipeline = AdmissionPipeline::new(
            Arc::new(FailingStore(StoreError::Internal("corrupt".into()))),
            &PipelineConfig::default(),
        );

        let decision = pipeline.check_admission(&ctx("u-8", Tier::Premium, 0)).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reason, DecisionReason::Degraded);
        assert_eq!(decision.effective_limit, 500);
        assert_eq!(pipeline.stats().degraded, 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_serves_from_local_cache() {
        let local = Arc::new(LocalStore::default());
        let store = FallbackStore::new(
            Arc::new(FailingStore(StoreError::Unavailable("down".into()))),
            local.clone(),
            Duration::from_millis(25),
            Duration::from_secs(5),
        );
        let config = config_with(Tier::Authenticated, TierLimit::new(2, 60));
        let pipeline = AdmissionPipeline::new(Arc::new(store), &config);

        let first = pipeline.check_admission(&ctx("u-9", Tier::Authenticated, 0)).await;
        let second = pipeline.check_admission(&ctx("u-9", Tier::Authenticated, 500)).await;
        let third = pipeline.check_admission(&ctx("u-9", Tier::Authenticated, 1_000)).await;

        assert!(first.allowed && second.allowed);
        assert_eq!(first.reason, DecisionReason::Admitted);
        assert_eq!(third.reason, DecisionReason::LimitExceeded);
        assert_eq!(local.len(), 1);
    }

    #[tokio::test]
    async fn test_redis_outage_still_decides() {
        let redis = RedisStore::new(RedisStoreConfig {
            url: "redis://127.0.0.1:1/".into(),
            ..Default::default()
        })
        .unwrap();
        let store = FallbackStore::new(
            Arc::new(redis),
            Arc::new(LocalStore::default()),
            Duration::from_millis(200),
            Duration::from_secs(5),
        );
        let pipeline = AdmissionPipeline::new(Arc::new(store), &PipelineConfig::default());

        let decision = pipeline.check_admission(&ctx("u-10", Tier::Premium, 0)).await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Admitted);
        assert_eq!(decision.remaining, 499);
    }

    #[tokio::test]
    async fn test_missing_identity_uses_anonymous_fallback() {
        let pipeline = pipeline(&PipelineConfig::default());
        let context = AdmissionContext::new(SubjectIdentity::default(), Tier::Admin, "").at(at(0));

        let decision = pipeline.check_admission(&context).await;
        assert!(decision.allowed);
        assert_eq!(decision.tier, Tier::Anonymous);
        assert_eq!(decision.effective_limit, 30);
    }

    #[tokio::test]
    async fn test_set_registry_applies_to_next_decision() {
        let pipeline = pipeline(&PipelineConfig::default());
        let before = pipeline.check_admission(&ctx("u-11", Tier::Premium, 0)).await;
        assert_eq!(before.effective_limit, 500);

        let config = config_with(Tier::Premium, TierLimit::new(7, 60));
        pipeline.set_registry(TierRegistry::new(config.limits));

        let after = pipeline.check_admission(&ctx("u-11", Tier::Premium, 1_000)).await;
        assert_eq!(after.effective_limit, 7);
    }

    #[tokio::test]
    async fn test_every_decision_emits_event() {
        let pipeline = pipeline(&PipelineConfig::default());
        let mut events = pipeline.subscribe();

        let decision = pipeline.check_admission(&ctx("u-12", Tier::Enterprise, 0)).await;
        let event = events.next().await.unwrap().unwrap();

        assert_eq!(event.key, decision.key.to_string());
        assert_eq!(event.tier, Tier::Enterprise);
        assert_eq!(event.endpoint_id, "GET /v1/items");
        assert!(event.allowed);
        assert_eq!(event.remaining, 1999);
        assert_eq!(event.timestamp, at(0));
    }

    #[test]
    fn test_pipeline_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AdmissionPipeline>();
    }
}
