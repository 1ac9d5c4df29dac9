//! Shared fakes for orchestrator integration tests
#![allow(dead_code)]

use analysis_cache::{CacheConfig, ManualClock, MemoryStore, ResultCache};
use analysis_service::{
    AIAnalysis, AnalysisProvider, AnalysisRequest, CallContext, CapabilitySet, DetectedFace,
    Orchestrator, OrchestratorConfig, PermanentKind, ProviderAttemptEvent, ProviderError,
    ProviderResult, RequestEvent, ResultMerger, TelemetrySink, TransientKind,
};
use async_trait::async_trait;
use chrono::Utc;
use resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted provider does on one call
#[derive(Clone)]
pub enum Step {
    Succeed {
        confidence: f64,
        tags: Vec<String>,
        faces: Vec<DetectedFace>,
    },
    Transient,
    Permanent,
    /// Never answers; only the orchestrator's timeout ends the call
    Hang,
    /// Answers after a delay
    Slow(Duration, Box<Step>),
}

impl Step {
    pub fn tags(confidence: f64, tags: &[&str]) -> Self {
        Step::Succeed {
            confidence,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            faces: Vec::new(),
        }
    }

    pub fn faces(confidence: f64, faces: Vec<DetectedFace>) -> Self {
        Step::Succeed {
            confidence,
            tags: Vec::new(),
            faces,
        }
    }

    pub fn slow(delay: Duration, step: Step) -> Self {
        Step::Slow(delay, Box::new(step))
    }
}

/// Provider that follows a script, then repeats its last step forever
pub struct ScriptedProvider {
    id: String,
    capabilities: CapabilitySet,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(id: &str, capabilities: CapabilitySet, step: Step) -> Arc<Self> {
        Self::scripted(id, capabilities, vec![step])
    }

    pub fn scripted(id: &str, capabilities: CapabilitySet, steps: Vec<Step>) -> Arc<Self> {
        let fallback = steps.last().cloned().unwrap_or(Step::Permanent);
        Arc::new(Self {
            id: id.to_string(),
            capabilities,
            script: Mutex::new(steps.into()),
            fallback,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or_else(|| self.fallback.clone())
        } else {
            script.front().cloned().unwrap_or_else(|| self.fallback.clone())
        }
    }

    async fn run(&self, step: Step, request: &AnalysisRequest) -> Result<ProviderResult, ProviderError> {
        let mut step = step;
        loop {
            match step {
                Step::Succeed {
                    confidence,
                    tags,
                    faces,
                } => {
                    let covered = self.capabilities.intersection(request.capabilities);
                    return Ok(ProviderResult::new(&self.id, covered, confidence)
                        .with_tags(tags)
                        .with_faces(faces)
                        .at(Utc::now()));
                }
                Step::Transient => {
                    return Err(ProviderError::transient(
                        &self.id,
                        TransientKind::Connection,
                        "connection reset",
                    ))
                }
                Step::Permanent => {
                    return Err(ProviderError::permanent(
                        &self.id,
                        PermanentKind::UnsupportedContent,
                        "unsupported format",
                    ))
                }
                Step::Hang => {
                    std::future::pending::<()>().await;
                }
                Step::Slow(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _ctx: &CallContext,
    ) -> Result<ProviderResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        self.run(step, request).await
    }
}

/// Telemetry sink that keeps every event
#[derive(Default)]
pub struct RecordingTelemetry {
    pub attempts: Mutex<Vec<ProviderAttemptEvent>>,
    pub requests: Mutex<Vec<RequestEvent>>,
}

impl RecordingTelemetry {
    pub fn attempts(&self) -> Vec<ProviderAttemptEvent> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<RequestEvent> {
        self.requests.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn provider_attempt(&self, event: &ProviderAttemptEvent) {
        self.attempts.lock().unwrap().push(event.clone());
    }

    fn request(&self, event: &RequestEvent) {
        self.requests.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub cache: Arc<ResultCache<AIAnalysis>>,
    pub clock: Arc<ManualClock>,
    pub telemetry: Arc<RecordingTelemetry>,
}

pub fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(8),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn harness(providers: Vec<Arc<ScriptedProvider>>) -> Harness {
    harness_with(providers, CircuitBreakerConfig::default())
}

pub fn harness_with(
    providers: Vec<Arc<ScriptedProvider>>,
    breaker_config: CircuitBreakerConfig,
) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let durable = Arc::new(MemoryStore::with_clock(1_000, 10 * 1024 * 1024, clock.clone()));
    let cache = Arc::new(ResultCache::with_clock(
        CacheConfig::default(),
        durable,
        clock.clone(),
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::with_providers(
        breaker_config,
        providers.iter().map(|p| p.id().to_string()),
    ));
    let telemetry = Arc::new(RecordingTelemetry::default());

    let providers: Vec<Arc<dyn AnalysisProvider>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn AnalysisProvider>)
        .collect();

    let orchestrator = Arc::new(Orchestrator::new(
        providers,
        breakers.clone(),
        cache.clone(),
        telemetry.clone(),
        ResultMerger::default(),
        OrchestratorConfig {
            per_call_timeout: Duration::from_secs(3),
            retry: retry_config(),
        },
    ));

    Harness {
        orchestrator,
        breakers,
        cache,
        clock,
        telemetry,
    }
}
