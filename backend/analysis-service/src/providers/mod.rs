//! Analysis provider contract and implementations
//!
//! A provider is any external content-analysis capability. Adapters hide
//! the wire protocol and report failures as [`ProviderError`], already
//! classified as transient or permanent so the retry policy and circuit
//! breaker can act on them.

pub mod google_vision;

pub use google_vision::{AuthMode, GoogleVisionProvider, VisionSettings};

use crate::model::{AnalysisRequest, CapabilitySet, ProviderResult};
use async_trait::async_trait;
use resilience::Transient;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call context handed to a provider
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The orchestrator abandons the call at this instant
    pub deadline: Instant,
    /// Fired when the call is abandoned; honoring it is best-effort
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// External content-analysis capability
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Stable identifier, used for breaker state, metadata and logs
    fn id(&self) -> &str;

    /// Capabilities this provider can answer for
    fn capabilities(&self) -> CapabilitySet;

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<ProviderResult, ProviderError>;
}

/// Failures worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Connection,
    RateLimited,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::Timeout => "timeout",
            TransientKind::Connection => "connection",
            TransientKind::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that will not go away by asking again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    InvalidInput,
    UnsupportedContent,
    Unauthorized,
}

impl PermanentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermanentKind::InvalidInput => "invalid_input",
            PermanentKind::UnsupportedContent => "unsupported_content",
            PermanentKind::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: transient {kind} failure: {message}")]
    Transient {
        provider: String,
        kind: TransientKind,
        message: String,
    },

    #[error("{provider}: permanent {kind} failure: {message}")]
    Permanent {
        provider: String,
        kind: PermanentKind,
        message: String,
    },
}

impl ProviderError {
    pub fn transient(
        provider: impl Into<String>,
        kind: TransientKind,
        message: impl Into<String>,
    ) -> Self {
        ProviderError::Transient {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(
        provider: impl Into<String>,
        kind: PermanentKind,
        message: impl Into<String>,
    ) -> Self {
        ProviderError::Permanent {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::transient(
            provider,
            TransientKind::Timeout,
            format!("no response within {:?}", after),
        )
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Transient { provider, .. } | ProviderError::Permanent { provider, .. } => {
                provider
            }
        }
    }

    /// Short label for metrics and logs
    pub fn kind_str(&self) -> &'static str {
        match self {
            ProviderError::Transient { kind, .. } => kind.as_str(),
            ProviderError::Permanent { kind, .. } => kind.as_str(),
        }
    }
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}
