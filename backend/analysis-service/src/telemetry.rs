//! Fire-and-forget telemetry for provider attempts and requests
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

/// How one provider invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Transient failures outlasted the retry budget
    Exhausted,
    Permanent,
    /// Breaker refused the call
    Skipped,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Exhausted => "exhausted",
            AttemptOutcome::Permanent => "permanent",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    StaleFallback,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::StaleFallback => "stale_fallback",
        }
    }
}

/// One provider invocation within a request.
///
/// Retries are folded into a single event: `attempts` counts the calls made
/// and `latency` spans all of them, backoff included. A provider skipped by
/// its breaker reports zero attempts.
#[derive(Debug, Clone)]
pub struct ProviderAttemptEvent {
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub content_id: String,
    pub providers_tried: usize,
    /// `None` when the request produced no analysis
    pub confidence: Option<f64>,
    pub cache: CacheOutcome,
    pub requires_manual_verification: bool,
    pub latency: Duration,
}

/// Receives telemetry events; implementations must not block.
///
/// `provider_attempt` fires once per provider per request, after retries
/// settle, and `request` once per request.
pub trait TelemetrySink: Send + Sync {
    fn provider_attempt(&self, event: &ProviderAttemptEvent);

    fn request(&self, event: &RequestEvent);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn provider_attempt(&self, _event: &ProviderAttemptEvent) {}

    fn request(&self, _event: &RequestEvent) {}
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

struct TelemetryMetrics {
    provider_attempts: CounterVec,
    provider_latency: HistogramVec,
    requests: CounterVec,
    request_confidence: HistogramVec,
    request_latency: HistogramVec,
}

impl TelemetryMetrics {
    fn new() -> Self {
        Self {
            provider_attempts: CounterVec::new(
                Opts::new(
                    "analysis_provider_invocations_total",
                    "Provider invocations by outcome",
                ),
                &["provider", "outcome"],
            )
            .expect("valid metric definition"),
            provider_latency: HistogramVec::new(
                HistogramOpts::new(
                    "analysis_provider_latency_seconds",
                    "Provider invocation latency including retries",
                )
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
                &["provider"],
            )
            .expect("valid metric definition"),
            requests: CounterVec::new(
                Opts::new("analysis_requests_total", "Analysis requests by cache outcome"),
                &["cache", "verification"],
            )
            .expect("valid metric definition"),
            request_confidence: HistogramVec::new(
                HistogramOpts::new(
                    "analysis_request_confidence",
                    "Merged confidence of returned analyses",
                )
                .buckets(vec![0.5, 0.7, 0.8, 0.9, 0.95, 0.98, 0.99, 1.0]),
                &["cache"],
            )
            .expect("valid metric definition"),
            request_latency: HistogramVec::new(
                HistogramOpts::new(
                    "analysis_request_latency_seconds",
                    "End-to-end analysis latency",
                )
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
                &["cache"],
            )
            .expect("valid metric definition"),
        }
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.provider_attempts.clone()))?;
        registry.register(Box::new(self.provider_latency.clone()))?;
        registry.register(Box::new(self.requests.clone()))?;
        registry.register(Box::new(self.request_confidence.clone()))?;
        registry.register(Box::new(self.request_latency.clone()))?;
        Ok(())
    }
}

fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// Prometheus counters and histograms plus a structured log line per event
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusTelemetry;

impl PrometheusTelemetry {
    pub fn new() -> Self {
        Self
    }

    /// Register the telemetry collectors with a registry
    pub fn register(registry: &Registry) -> Result<(), prometheus::Error> {
        metrics().register(registry)
    }
}

impl TelemetrySink for PrometheusTelemetry {
    fn provider_attempt(&self, event: &ProviderAttemptEvent) {
        let m = metrics();
        m.provider_attempts
            .with_label_values(&[event.provider.as_str(), event.outcome.as_str()])
            .inc();
        if event.outcome != AttemptOutcome::Skipped {
            m.provider_latency
                .with_label_values(&[event.provider.as_str()])
                .observe(event.latency.as_secs_f64());
        }

        info!(
            target: "analysis_telemetry",
            provider = %event.provider,
            outcome = event.outcome.as_str(),
            attempts = event.attempts,
            latency_ms = event.latency.as_millis() as u64,
            "provider_attempt"
        );
    }

    fn request(&self, event: &RequestEvent) {
        let m = metrics();
        let verification = if event.requires_manual_verification {
            "manual"
        } else {
            "auto"
        };
        m.requests
            .with_label_values(&[event.cache.as_str(), verification])
            .inc();
        if let Some(confidence) = event.confidence {
            m.request_confidence
                .with_label_values(&[event.cache.as_str()])
                .observe(confidence);
        }
        m.request_latency
            .with_label_values(&[event.cache.as_str()])
            .observe(event.latency.as_secs_f64());

        info!(
            target: "analysis_telemetry",
            content_id = %event.content_id,
            providers_tried = event.providers_tried,
            confidence = event.confidence,
            cache = event.cache.as_str(),
            requires_manual_verification = event.requires_manual_verification,
            latency_ms = event.latency.as_millis() as u64,
            "analysis_request"
        );
    }
}
