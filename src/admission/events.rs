//! Observability events, one per decision.
//!
//! Events are logged through `tracing` and published on a broadcast channel
//! for in-process consumers. Events at or above the alert severity are also
//! written to the `turnstile::alert` target for the alerting collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::decision::{AdmissionDecision, DecisionReason};
use super::tier::Tier;

/// How loudly an event should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Notice,
    Warning,
    Critical,
}

/// Structured record of one admission decision.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionEvent {
    pub event_id: Uuid,
    pub key: String,
    pub tier: Tier,
    pub endpoint_id: String,
    pub allowed: bool,
    pub blocked: bool,
    pub remaining: u64,
    pub reason: DecisionReason,
    pub degraded: bool,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl AdmissionEvent {
    /// Build the event for a decision. `escalated` marks a denial that just
    /// created or extended a block.
    pub fn from_decision(
        decision: &AdmissionDecision,
        endpoint_id: &str,
        timestamp: DateTime<Utc>,
        escalated: bool,
    ) -> Self {
        let severity = match decision.reason {
            _ if escalated => Severity::Critical,
            DecisionReason::Admitted => Severity::Info,
            DecisionReason::LimitExceeded => Severity::Notice,
            DecisionReason::Burst | DecisionReason::Blocked | DecisionReason::Degraded => {
                Severity::Warning
            }
        };

        Self {
            event_id: Uuid::new_v4(),
            key: decision.key.to_string(),
            tier: decision.tier,
            endpoint_id: endpoint_id.to_string(),
            allowed: decision.allowed,
            blocked: decision.blocked,
            remaining: decision.remaining,
            reason: decision.reason,
            degraded: decision.is_degraded(),
            severity,
            timestamp,
        }
    }
}

/// Event emitter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Events at or above this severity are forwarded as alerts
    #[serde(default = "default_alert_severity")]
    pub alert_severity: Severity,
    /// Broadcast buffer per subscriber
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            alert_severity: default_alert_severity(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_alert_severity() -> Severity {
    Severity::Warning
}

fn default_event_buffer() -> usize {
    1024
}

/// Publishes admission events.
pub struct EventEmitter {
    sender: broadcast::Sender<AdmissionEvent>,
    alert_severity: Severity,
    emitted: AtomicU64,
    alerts: AtomicU64,
}

impl EventEmitter {
    pub fn new(config: &ObservabilityConfig) -> Self {
        let (sender, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            sender,
            alert_severity: config.alert_severity,
            emitted: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
        }
    }

    /// Log and publish one event.
    pub fn emit(&self, event: AdmissionEvent) {
        debug!(
            target: "turnstile::decision",
            key = %event.key,
            tier = %event.tier,
            endpoint = %event.endpoint_id,
            allowed = event.allowed,
            blocked = event.blocked,
            remaining = event.remaining,
            reason = event.reason.as_str(),
            degraded = event.degraded,
            "Admission decision"
        );

        if event.severity >= self.alert_severity {
            self.alerts.fetch_add(1, Ordering::Relaxed);
            let payload = serde_json::to_string(&event).unwrap_or_default();
            warn!(
                target: "turnstile::alert",
                severity = ?event.severity,
                key = %event.key,
                reason = event.reason.as_str(),
                event = %payload,
                "Admission alert"
            );
        }

        self.emitted.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Stream of events emitted from now on.
    pub fn subscribe(&self) -> BroadcastStream<AdmissionEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn alerts(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(&ObservabilityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{KeyResolver, SubjectIdentity};
    use futures::StreamExt;

    fn decision(reason: DecisionReason) -> AdmissionDecision {
        let key = KeyResolver::new()
            .resolve(&SubjectIdentity::user("u"), Tier::Premium, "GET /", None)
            .unwrap();
        AdmissionDecision {
            allowed: matches!(reason, DecisionReason::Admitted | DecisionReason::Degraded),
            remaining: 3,
            reset_at: Utc::now(),
            retry_after_seconds: None,
            blocked: reason == DecisionReason::Blocked,
            effective_limit: 10,
            tier: Tier::Premium,
            key,
            reason,
        }
    }

    #[test]
    fn test_severity_mapping() {
        let now = Utc::now();
        let sev = |reason, escalated| {
            AdmissionEvent::from_decision(&decision(reason), "GET /", now, escalated).severity
        };

        assert_eq!(sev(DecisionReason::Admitted, false), Severity::Info);
        assert_eq!(sev(DecisionReason::LimitExceeded, false), Severity::Notice);
        assert_eq!(sev(DecisionReason::Burst, false), Severity::Warning);
        assert_eq!(sev(DecisionReason::Degraded, false), Severity::Warning);
        assert_eq!(sev(DecisionReason::LimitExceeded, true), Severity::Critical);
    }

    #[test]
    fn test_event_carries_decision_fields() {
        let now = Utc::now();
        let d = decision(DecisionReason::Blocked);
        let event = AdmissionEvent::from_decision(&d, "POST /v1/login", now, false);

        assert_eq!(event.key, d.key.to_string());
        assert_eq!(event.endpoint_id, "POST /v1/login");
        assert!(!event.allowed);
        assert!(event.blocked);
        assert_eq!(event.remaining, 3);
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn test_alert_threshold_counts() {
        let emitter = EventEmitter::default();
        let now = Utc::now();

        emitter.emit(AdmissionEvent::from_decision(&decision(DecisionReason::Admitted), "a", now, false));
        emitter.emit(AdmissionEvent::from_decision(&decision(DecisionReason::LimitExceeded), "a", now, false));
        emitter.emit(AdmissionEvent::from_decision(&decision(DecisionReason::Blocked), "a", now, false));

        assert_eq!(emitter.emitted(), 3);
        assert_eq!(emitter.alerts(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let emitter = EventEmitter::default();
        let mut stream = emitter.subscribe();

        emitter.emit(AdmissionEvent::from_decision(
            &decision(DecisionReason::Burst),
            "GET /",
            Utc::now(),
            false,
        ));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.reason, DecisionReason::Burst);
    }
}
