//! Provider fallback loop with breaker gating, retries, merging and caching
//!
//! One request walks the configured providers in priority order. Each
//! eligible provider is gated by its circuit breaker, invoked under the
//! retry policy with a per-call timeout, and its result folded into the
//! running analysis. The loop stops early once the analysis is confident
//! enough and covers every requested capability.
//!
//! A cached partial analysis seeds the next run, so contributions from
//! providers that already succeeded survive while failed ones are retried.
//!
//! Concurrent requests for the same cache key are single-flight: the first
//! caller runs the loop and everybody else waits for its result. A request
//! that overrides the confidence threshold gets its own key.
use crate::model::{AIAnalysis, AnalysisRequest, ProviderResult};
use crate::providers::{AnalysisProvider, CallContext, ProviderError};
use crate::services::merger::{needs_verification, MergeOutcome, ResultMerger};
use crate::telemetry::{
    AttemptOutcome, CacheOutcome, ProviderAttemptEvent, RequestEvent, TelemetrySink,
};
use crate::AnalysisError;
use analysis_cache::{CacheEntry, CacheKey, ResultCache};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use resilience::{
    with_retry, with_timeout, CircuitBreakerRegistry, RetryConfig, RetryError, RetryPolicy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedOutcome = Option<Result<AIAnalysis, AnalysisError>>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for a single provider attempt
    pub per_call_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let preset = resilience::analysis_provider_config();
        Self {
            per_call_timeout: preset.timeout.duration,
            retry: preset.retry.unwrap_or_default(),
        }
    }
}

/// How the provider loop ended
struct LoopOutcome {
    analysis: AIAnalysis,
    tried: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    early_exit: bool,
}

pub struct Orchestrator {
    providers: Vec<Arc<dyn AnalysisProvider>>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<ResultCache<AIAnalysis>>,
    telemetry: Arc<dyn TelemetrySink>,
    merger: ResultMerger,
    retry: RetryPolicy,
    config: OrchestratorConfig,
    in_flight: DashMap<String, watch::Receiver<SharedOutcome>>,
}

impl Orchestrator {
    /// `providers` is the static priority order
    pub fn new(
        providers: Vec<Arc<dyn AnalysisProvider>>,
        breakers: Arc<CircuitBreakerRegistry>,
        cache: Arc<ResultCache<AIAnalysis>>,
        telemetry: Arc<dyn TelemetrySink>,
        merger: ResultMerger,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            providers,
            breakers,
            cache,
            telemetry,
            merger,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.id())
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ResultCache<AIAnalysis>> {
        &self.cache
    }

    /// Early exit and the verification flag depend on the threshold, so an
    /// overridden threshold never shares entries with the default one.
    pub fn cache_key(request: &AnalysisRequest) -> String {
        let fingerprint = request.capabilities.fingerprint();
        match request.options.min_confidence {
            Some(threshold) => CacheKey::analysis_at(&request.content_id, &fingerprint, threshold),
            None => CacheKey::analysis(&request.content_id, &fingerprint),
        }
    }

    fn threshold_for(&self, request: &AnalysisRequest) -> f64 {
        request
            .options
            .min_confidence
            .unwrap_or(self.merger.config().verification_threshold)
    }

    pub async fn process(&self, request: AnalysisRequest) -> Result<AIAnalysis, AnalysisError> {
        self.process_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Analyze `request`, aborting with [`AnalysisError::Cancelled`] when
    /// `cancel` fires. Nothing is merged or cached after cancellation.
    pub async fn process_with_cancel(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AIAnalysis, AnalysisError> {
        let key = Self::cache_key(&request);

        loop {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled(request.content_id.clone()));
            }

            let latch = match self.in_flight.entry(key.clone()) {
                Entry::Occupied(entry) => Err(entry.get().clone()),
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(rx);
                    Ok(tx)
                }
            };

            match latch {
                Ok(tx) => {
                    let _guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        key: &key,
                    };
                    let result = self.run(&key, &request, &cancel).await;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Err(mut rx) => {
                    debug!(key = %key, "Joining in-flight analysis");
                    let shared = tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AnalysisError::Cancelled(request.content_id.clone()));
                        }
                        shared = wait_for_leader(&mut rx) => shared,
                    };

                    match shared {
                        Some(Err(AnalysisError::Cancelled(_))) | None => {
                            // Leader went away without an answer for us
                            debug!(key = %key, "In-flight leader abandoned, retrying");
                            tokio::task::yield_now().await;
                            continue;
                        }
                        Some(result) => return result,
                    }
                }
            }
        }
    }

    async fn run(
        &self,
        key: &str,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AIAnalysis, AnalysisError> {
        let started = Instant::now();
        let threshold = self.threshold_for(request);

        let cached = self.cache.get(key).await;
        if let Some(entry) = cached.as_ref().filter(|entry| entry.complete) {
            debug!(key = %key, "Complete analysis served from cache");
            let mut analysis = entry.value.clone();
            analysis.requires_manual_verification = needs_verification(
                analysis.confidence,
                analysis.contributors.len(),
                threshold,
            );
            self.emit_request(request, 0, Some(&analysis), CacheOutcome::Hit, started);
            return Ok(analysis);
        }

        let seed = cached.as_ref().map(|entry| entry.value.clone());
        let outcome = match self.provider_loop(request, seed, threshold, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit_request(request, 0, None, CacheOutcome::Miss, started);
                return Err(err);
            }
        };

        if outcome.succeeded > 0 {
            let covered = outcome
                .analysis
                .capabilities
                .contains_all(request.capabilities);
            let complete = outcome.early_exit
                || (outcome.failed == 0 && outcome.skipped == 0 && covered);
            let ttl = self.cache.ttl().for_result(complete);

            if let Err(e) = self
                .cache
                .put(key, outcome.analysis.clone(), complete, ttl)
                .await
            {
                warn!(key = %key, error = %e, "Failed to cache analysis");
            }

            info!(
                content_id = %request.content_id,
                confidence = outcome.analysis.confidence,
                contributors = ?outcome.analysis.contributors,
                complete,
                requires_manual_verification = outcome.analysis.requires_manual_verification,
                "Analysis merged"
            );
            self.emit_request(
                request,
                outcome.tried,
                Some(&outcome.analysis),
                CacheOutcome::Miss,
                started,
            );
            return Ok(outcome.analysis);
        }

        if let Some(CacheEntry { value: mut fallback, .. }) = cached {
            warn!(
                content_id = %request.content_id,
                tried = outcome.tried,
                skipped = outcome.skipped,
                "No provider succeeded, serving cached partial analysis"
            );
            fallback.requires_manual_verification = true;
            self.emit_request(
                request,
                outcome.tried,
                Some(&fallback),
                CacheOutcome::StaleFallback,
                started,
            );
            return Ok(fallback);
        }

        error!(
            content_id = %request.content_id,
            tried = outcome.tried,
            skipped = outcome.skipped,
            "All providers exhausted"
        );
        self.emit_request(request, outcome.tried, None, CacheOutcome::Miss, started);
        Err(AnalysisError::AllProvidersExhausted {
            content_id: request.content_id.clone(),
            attempted: outcome.tried,
            skipped: outcome.skipped,
        })
    }

    /// Walk eligible providers, merging into `seed` when a cached partial
    /// analysis exists.
    async fn provider_loop(
        &self,
        request: &AnalysisRequest,
        seed: Option<AIAnalysis>,
        threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, AnalysisError> {
        let mut outcome = LoopOutcome {
            analysis: seed.unwrap_or_else(|| AIAnalysis::empty(request.content_id.clone())),
            tried: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            early_exit: false,
        };

        let eligible = self
            .providers
            .iter()
            .filter(|provider| provider.capabilities().intersects(request.capabilities));

        for provider in eligible {
            let id = provider.id();

            if !self.breakers.allow(id) {
                debug!(provider = %id, "Circuit open, skipping provider");
                outcome.skipped += 1;
                self.telemetry.provider_attempt(&ProviderAttemptEvent {
                    provider: id.to_string(),
                    outcome: AttemptOutcome::Skipped,
                    latency: Duration::ZERO,
                    attempts: 0,
                });
                continue;
            }

            outcome.tried += 1;
            let result = match self.invoke(provider.as_ref(), request, cancel).await {
                Ok(result) => result,
                Err(RetryError::Cancelled { attempts }) => {
                    self.breakers.record_abandoned(id);
                    info!(
                        content_id = %request.content_id,
                        provider = %id,
                        attempts,
                        "Analysis cancelled"
                    );
                    return Err(AnalysisError::Cancelled(request.content_id.clone()));
                }
                Err(RetryError::Permanent { attempts, error }) => {
                    self.breakers.record_failure(id);
                    outcome.failed += 1;
                    error!(
                        content_id = %request.content_id,
                        provider = %id,
                        attempts,
                        kind = error.kind_str(),
                        error = %error,
                        "Provider rejected request permanently"
                    );
                    continue;
                }
                Err(RetryError::Exhausted { attempts, error }) => {
                    self.breakers.record_failure(id);
                    outcome.failed += 1;
                    warn!(
                        content_id = %request.content_id,
                        provider = %id,
                        attempts,
                        kind = error.kind_str(),
                        error = %error,
                        "Provider failed after retries"
                    );
                    continue;
                }
            };

            self.breakers.record_success(id);
            outcome.succeeded += 1;

            let analysis = std::mem::replace(
                &mut outcome.analysis,
                AIAnalysis::empty(request.content_id.clone()),
            );
            outcome.analysis = match self.merger.merge_with_threshold(analysis, result, threshold) {
                MergeOutcome::Merged(merged) => merged,
                MergeOutcome::Stale(unchanged) => unchanged,
            };

            if outcome.analysis.confidence >= threshold
                && outcome
                    .analysis
                    .capabilities
                    .contains_all(request.capabilities)
            {
                debug!(
                    content_id = %request.content_id,
                    provider = %id,
                    confidence = outcome.analysis.confidence,
                    "Confidence threshold reached, stopping early"
                );
                outcome.early_exit = true;
                break;
            }
        }

        // A seed carries the flag from whichever threshold produced it
        outcome.analysis.requires_manual_verification = needs_verification(
            outcome.analysis.confidence,
            outcome.analysis.contributors.len(),
            threshold,
        );

        Ok(outcome)
    }

    /// One provider invocation: retries plus a timeout on every attempt
    async fn invoke(
        &self,
        provider: &dyn AnalysisProvider,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResult, RetryError<ProviderError>> {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let timeout = self.config.per_call_timeout;

        let result = with_retry(&self.retry, cancel, move |attempt| {
            attempts_ref.store(attempt, Ordering::Relaxed);
            call_once(provider, request, cancel, timeout)
        })
        .await;

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(RetryError::Permanent { .. }) => AttemptOutcome::Permanent,
            Err(RetryError::Exhausted { .. }) => AttemptOutcome::Exhausted,
            Err(RetryError::Cancelled { .. }) => AttemptOutcome::Cancelled,
        };
        self.telemetry.provider_attempt(&ProviderAttemptEvent {
            provider: provider.id().to_string(),
            outcome,
            latency: started.elapsed(),
            attempts: attempts.load(Ordering::Relaxed),
        });

        result
    }

    fn emit_request(
        &self,
        request: &AnalysisRequest,
        providers_tried: usize,
        analysis: Option<&AIAnalysis>,
        cache: CacheOutcome,
        started: Instant,
    ) {
        self.telemetry.request(&RequestEvent {
            content_id: request.content_id.clone(),
            providers_tried,
            confidence: analysis.map(|a| a.confidence),
            cache,
            requires_manual_verification: analysis
                .map_or(true, |a| a.requires_manual_verification),
            latency: started.elapsed(),
        });
    }
}

async fn call_once(
    provider: &dyn AnalysisProvider,
    request: &AnalysisRequest,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<ProviderResult, ProviderError> {
    let ctx = CallContext::new(timeout, cancel.child_token());

    match with_timeout(timeout, provider.analyze(request, &ctx)).await {
        Ok(result) => result,
        Err(_) => {
            ctx.cancel.cancel();
            debug!(provider = %provider.id(), timeout = ?timeout, "Provider call timed out");
            Err(ProviderError::timeout(provider.id(), timeout))
        }
    }
}

/// Resolves to the leader's result, or `None` if the leader was dropped
async fn wait_for_leader(rx: &mut watch::Receiver<SharedOutcome>) -> SharedOutcome {
    match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => (*outcome).clone(),
        Err(_) => None,
    }
}

/// Clears the in-flight latch when the leader finishes or is dropped
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, watch::Receiver<SharedOutcome>>,
    key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(self.key);
    }
}
