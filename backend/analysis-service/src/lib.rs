//! Analysis Service - provider orchestration for family photo and video analysis
//!
//! This service provides:
//! - A provider contract for external content-analysis capabilities
//! - Google Cloud Vision as a concrete provider
//! - Result merging with confidence-aware manual verification flags
//! - An orchestrator with per-provider circuit breakers, retries, timeouts,
//!   single-flight requests and a two-tier result cache
//! - A batch job for analyzing many content items

pub mod config;
pub mod jobs;
pub mod model;
pub mod orchestrator;
pub mod providers;
pub mod services;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use jobs::{BatchItem, BatchJob, BatchStats};
pub use model::{
    AIAnalysis, AnalysisOptions, AnalysisRequest, BoundingBox, Capability, CapabilitySet,
    Contribution, DetectedFace, ProviderMetadata, ProviderResult,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use providers::{
    AnalysisProvider, AuthMode, CallContext, GoogleVisionProvider, PermanentKind, ProviderError,
    TransientKind, VisionSettings,
};
pub use services::{ConfidenceWeighting, MergeOutcome, MergerConfig, ResultMerger};
pub use telemetry::{
    AttemptOutcome, CacheOutcome, NoopTelemetry, PrometheusTelemetry, ProviderAttemptEvent,
    RequestEvent, TelemetrySink,
};

/// Analysis service error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error(
        "All providers exhausted for {content_id} ({attempted} attempted, {skipped} skipped by open circuits)"
    )]
    AllProvidersExhausted {
        content_id: String,
        attempted: usize,
        skipped: usize,
    },

    #[error("Analysis of {0} was cancelled")]
    Cancelled(String),
}
