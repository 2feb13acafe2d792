//! Admission service implementation.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::turnstile::admission::v1::{
    admission_service_server::AdmissionService, CheckAdmissionRequest, CheckAdmissionResponse,
    Reason as ProtoReason, Tier as ProtoTier, UnblockRequest, UnblockResponse,
};
use crate::admission::{
    AdmissionContext, AdmissionDecision, AdmissionKey, AdmissionPipeline, DecisionReason,
    SubjectIdentity, Tier,
};

/// gRPC adapter over an [`AdmissionPipeline`].
pub struct AdmissionServiceImpl {
    pipeline: Arc<AdmissionPipeline>,
}

impl AdmissionServiceImpl {
    pub fn new(pipeline: Arc<AdmissionPipeline>) -> Self {
        Self { pipeline }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn tier_from_proto(value: i32) -> Result<Tier, Status> {
    match ProtoTier::try_from(value) {
        Ok(ProtoTier::Unspecified) | Ok(ProtoTier::Anonymous) => Ok(Tier::Anonymous),
        Ok(ProtoTier::Authenticated) => Ok(Tier::Authenticated),
        Ok(ProtoTier::Premium) => Ok(Tier::Premium),
        Ok(ProtoTier::Enterprise) => Ok(Tier::Enterprise),
        Ok(ProtoTier::Admin) => Ok(Tier::Admin),
        Err(_) => Err(Status::invalid_argument(format!("unknown tier {}", value))),
    }
}

fn tier_to_proto(tier: Tier) -> ProtoTier {
    match tier {
        Tier::Anonymous => ProtoTier::Anonymous,
        Tier::Authenticated => ProtoTier::Authenticated,
        Tier::Premium => ProtoTier::Premium,
        Tier::Enterprise => ProtoTier::Enterprise,
        Tier::Admin => ProtoTier::Admin,
    }
}

fn reason_to_proto(reason: DecisionReason) -> ProtoReason {
    match reason {
        DecisionReason::Admitted => ProtoReason::Admitted,
        DecisionReason::LimitExceeded => ProtoReason::LimitExceeded,
        DecisionReason::Burst => ProtoReason::Burst,
        DecisionReason::Blocked => ProtoReason::Blocked,
        DecisionReason::Degraded => ProtoReason::Degraded,
    }
}

fn timestamp_from_proto(ms: i64) -> Result<DateTime<Utc>, Status> {
    if ms == 0 {
        return Ok(Utc::now());
    }
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Status::invalid_argument(format!("timestamp {} out of range", ms)))
}

fn context_from_proto(req: CheckAdmissionRequest) -> Result<AdmissionContext, Status> {
    let tier = tier_from_proto(req.tier)?;
    let timestamp = timestamp_from_proto(req.timestamp_ms)?;
    let subject = SubjectIdentity {
        user_id: non_empty(req.user_id),
        api_key_id: non_empty(req.api_key_id),
        source_addr: non_empty(req.source_address),
    };

    let mut ctx = AdmissionContext::new(subject, tier, req.endpoint_id).at(timestamp);
    if let Some(geo) = non_empty(req.geo) {
        ctx = ctx.with_geo(geo);
    }
    Ok(ctx)
}

fn response_from_decision(decision: AdmissionDecision) -> CheckAdmissionResponse {
    CheckAdmissionResponse {
        allowed: decision.allowed,
        remaining: decision.remaining,
        reset_at_ms: decision.reset_at.timestamp_millis(),
        retry_after_seconds: decision.retry_after_seconds,
        blocked: decision.blocked,
        effective_limit: decision.effective_limit,
        tier: tier_to_proto(decision.tier).into(),
        key: decision.key.to_string(),
        reason: reason_to_proto(decision.reason).into(),
    }
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    #[instrument(
        skip(self, request),
        fields(
            endpoint = %request.get_ref().endpoint_id,
            tier = request.get_ref().tier
        )
    )]
    async fn check_admission(
        &self,
        request: Request<CheckAdmissionRequest>,
    ) -> Result<Response<CheckAdmissionResponse>, Status> {
        let ctx = context_from_proto(request.into_inner()).map_err(|status| {
            warn!(error = %status.message(), "Rejected admission request");
            status
        })?;

        let decision = self.pipeline.check_admission(&ctx).await;
        debug!(
            key = %decision.key,
            allowed = decision.allowed,
            reason = decision.reason.as_str(),
            "Admission decision made"
        );

        Ok(Response::new(response_from_decision(decision)))
    }

    #[instrument(skip(self, request))]
    async fn unblock(
        &self,
        request: Request<UnblockRequest>,
    ) -> Result<Response<UnblockResponse>, Status> {
        let req = request.into_inner();
        let key: AdmissionKey = req.key.parse().map_err(|e| {
            warn!(key = %req.key, "Received unblock request with malformed key");
            Status::invalid_argument(format!("{}", e))
        })?;

        self.pipeline
            .unblock(&key)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(Response::new(UnblockResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{LimitsConfig, PipelineConfig, TierLimit};
    use crate::store::testing::FailingStore;
    use crate::store::{LocalStore, StoreError};
    use std::collections::HashMap;

    fn service_with(config: &PipelineConfig) -> AdmissionServiceImpl {
        let pipeline = AdmissionPipeline::new(Arc::new(LocalStore::default()), config);
        AdmissionServiceImpl::new(Arc::new(pipeline))
    }

    fn request(user: &str, tier: ProtoTier, ms: i64) -> Request<CheckAdmissionRequest> {
        Request::new(CheckAdmissionRequest {
            user_id: user.to_string(),
            tier: tier.into(),
            endpoint_id: "GET /v1/orders".to_string(),
            timestamp_ms: ms,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_valid_request_is_admitted() {
        let service = service_with(&PipelineConfig::default());

        let response = service
            .check_admission(request("u-1", ProtoTier::Premium, 1_700_000_000_000))
            .await
            .unwrap()
            .into_inner();

        assert!(response.allowed);
        assert_eq!(response.remaining, 499);
        assert_eq!(response.effective_limit, 500);
        assert_eq!(response.tier, i32::from(ProtoTier::Premium));
        assert_eq!(response.reason, i32::from(ProtoReason::Admitted));
        assert_eq!(response.reset_at_ms, 1_700_000_060_000);
        assert_eq!(response.retry_after_seconds, None);
        assert_eq!(response.key.len(), AdmissionKey::LEN);
    }

    #[tokio::test]
    async fn test_unknown_tier_rejected() {
        let service = service_with(&PipelineConfig::default());

        let result = service
            .check_admission(Request::new(CheckAdmissionRequest {
                user_id: "u-1".to_string(),
                tier: 42,
                ..Default::default()
            }))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unspecified_tier_is_anonymous() {
        let service = service_with(&PipelineConfig::default());

        let response = service
            .check_admission(request("u-1", ProtoTier::Unspecified, 0))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.tier, i32::from(ProtoTier::Anonymous));
        assert_eq!(response.effective_limit, 30);
    }

    #[tokio::test]
    async fn test_missing_identity_is_not_rejected() {
        let service = service_with(&PipelineConfig::default());

        let response = service
            .check_admission(Request::new(CheckAdmissionRequest {
                tier: ProtoTier::Enterprise.into(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.allowed);
        assert_eq!(response.tier, i32::from(ProtoTier::Anonymous));
    }

    #[tokio::test]
    async fn test_denial_carries_retry_after() {
        let mut tiers = HashMap::new();
        tiers.insert(Tier::Authenticated, TierLimit::new(1, 60));
        let config = PipelineConfig {
            limits: LimitsConfig {
                tiers,
                endpoints: HashMap::new(),
            },
            ..Default::default()
        };
        let service = service_with(&config);

        let base = 1_700_000_000_000;
        service
            .check_admission(request("u-2", ProtoTier::Authenticated, base))
            .await
            .unwrap();
        let denied = service
            .check_admission(request("u-2", ProtoTier::Authenticated, base + 500))
            .await
            .unwrap()
            .into_inner();

        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reason, i32::from(ProtoReason::LimitExceeded));
        assert_eq!(denied.retry_after_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_unblock_rejects_malformed_key() {
        let service = service_with(&PipelineConfig::default());

        let result = service
            .unblock(Request::new(UnblockRequest {
                key: "nope".to_string(),
            }))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unblock_known_key() {
        let service = service_with(&PipelineConfig::default());
        let key = service
            .check_admission(request("u-3", ProtoTier::Premium, 0))
            .await
            .unwrap()
            .into_inner()
            .key;

        let result = service.unblock(Request::new(UnblockRequest { key })).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unblock_store_failure_is_unavailable() {
        let pipeline = AdmissionPipeline::new(
            Arc::new(FailingStore(StoreError::Internal("broken".into()))),
            &PipelineConfig::default(),
        );
        let service = AdmissionServiceImpl::new(Arc::new(pipeline));

        let result = service
            .unblock(Request::new(UnblockRequest {
                key: "a".repeat(AdmissionKey::LEN),
            }))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::Unavailable);
    }
}
