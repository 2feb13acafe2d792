//! Admission control.
//!
//! This module contains key derivation, tier limits, burst and violation
//! handling, and the pipeline that ties them to an accounting store.

mod adaptive;
mod blocklist;
mod burst;
mod decision;
mod events;
mod key;
mod pipeline;
mod registry;
mod tier;

pub use adaptive::{AdaptiveAdjuster, AdaptiveConfig};
pub use blocklist::{BlockStatus, BlocklistManager, ViolationConfig, ViolationOutcome};
pub use burst::{BurstConfig, BurstGuard, JitterSource, SeededJitter};
pub use decision::{AdmissionContext, AdmissionDecision, DecisionReason};
pub use events::{AdmissionEvent, EventEmitter, ObservabilityConfig, Severity};
pub use key::{AdmissionKey, KeyError, KeyResolver, ResolvedKey, SubjectIdentity, SubjectKind};
pub use pipeline::{AdmissionPipeline, DecisionStats, PipelineConfig};
pub use registry::{LimitsConfig, TierRegistry};
pub use tier::{EndpointOverride, Tier, TierLimit};
