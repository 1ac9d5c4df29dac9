/// Per-provider circuit breaker with exponential reopen backoff
///
/// State transitions:
/// - Closed → Open: consecutive failures reach `failure_threshold`
/// - Open → HalfOpen: once the scheduled reopen time has passed; exactly one probe is admitted
/// - HalfOpen → Closed: the probe succeeds (counter and reset timeout return to baseline)
/// - HalfOpen → Open: the probe fails; the reset timeout doubles, capped at `max_reset_timeout`
use crate::metrics::CircuitBreakerMetrics;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Provider considered down, calls are skipped
    Open,
    /// Reset timeout elapsed, a single probe call decides the next state
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    pub failure_threshold: u32,
    /// Initial wait before an open circuit admits a probe
    pub reset_timeout: Duration,
    /// Upper bound for the reset timeout after repeated probe failures
    pub max_reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            max_reset_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Point-in-time view of one breaker (for monitoring and tests)
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub reopen_at: Option<Instant>,
    pub reset_timeout: Duration,
}

struct BreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    reopen_at: Option<Instant>,
    reset_timeout: Duration,
    probe_in_flight: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open - failing fast")]
    Open,
    #[error("Call failed: {0}")]
    CallFailed(String),
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(BreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                reopen_at: None,
                reset_timeout: config.reset_timeout,
                probe_in_flight: false,
            })),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute a future with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.allow() {
            return Err(CircuitBreakerError::Open);
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::CallFailed(e.to_string()))
            }
        }
    }

    /// Whether a call may be attempted right now.
    ///
    /// In HalfOpen only the first caller gets `true`; everyone else is
    /// rejected until that probe reports back.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();

        let allowed = match state.current {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let due = state
                    .reopen_at
                    .map_or(true, |reopen_at| Instant::now() >= reopen_at);
                if due {
                    info!(breaker = %self.name, "Circuit breaker: Open → HalfOpen");
                    CircuitBreakerMetrics::record_state_transition(&self.name, "open", "half_open");
                    state.current = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        };

        CircuitBreakerMetrics::record_call(
            &self.name,
            state.current.as_str(),
            if allowed { "allowed" } else { "rejected" },
        );
        allowed
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();

        if state.current != CircuitState::Closed {
            info!(
                breaker = %self.name,
                "Circuit breaker: {} → Closed",
                state.current.as_str()
            );
            CircuitBreakerMetrics::record_state_transition(
                &self.name,
                state.current.as_str(),
                "closed",
            );
        }

        state.current = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.reopen_at = None;
        state.reset_timeout = self.config.reset_timeout;
        state.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(now);

        match state.current {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        reset_timeout = ?state.reset_timeout,
                        "Circuit breaker: Closed → Open"
                    );
                    CircuitBreakerMetrics::record_state_transition(&self.name, "closed", "open");
                    state.current = CircuitState::Open;
                    state.reset_timeout = self.config.reset_timeout;
                    state.reopen_at = Some(now + state.reset_timeout);
                }
            }
            CircuitState::HalfOpen => {
                let doubled = state.reset_timeout.saturating_mul(2);
                state.reset_timeout = doubled.min(self.config.max_reset_timeout);
                warn!(
                    breaker = %self.name,
                    reset_timeout = ?state.reset_timeout,
                    "Circuit breaker: HalfOpen → Open (probe failed)"
                );
                CircuitBreakerMetrics::record_state_transition(&self.name, "half_open", "open");
                state.current = CircuitState::Open;
                state.reopen_at = Some(now + state.reset_timeout);
                state.probe_in_flight = false;
            }
            CircuitState::Open => {
                // Late outcome of a call admitted before the circuit opened
            }
        }
    }

    /// Release an admitted call that never produced an outcome (cancelled
    /// by the caller). Frees the HalfOpen probe slot without touching counters.
    pub fn record_abandoned(&self) {
        let mut state = self.state.lock();
        if state.current == CircuitState::HalfOpen && state.probe_in_flight {
            debug!(breaker = %self.name, "Circuit breaker: probe abandoned");
            state.probe_in_flight = false;
        }
    }

    /// Get current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state.lock().current
    }

    pub fn snapshot(&self) -> ProviderState {
        let state = self.state.lock();
        ProviderState {
            state: state.current,
            consecutive_failures: state.consecutive_failures,
            last_failure_at: state.last_failure_at,
            reopen_at: state.reopen_at,
            reset_timeout: state.reset_timeout,
        }
    }
}

/// One breaker per provider, keyed by provider id.
///
/// The map lock is only held to look a breaker up; each breaker carries its
/// own lock, so provider A's outcomes never contend with provider B's.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with a breaker pre-created for every configured provider
    pub fn with_providers<I, S>(config: CircuitBreakerConfig, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new(config);
        {
            let mut breakers = registry.breakers.write();
            for id in providers {
                let id = id.into();
                let breaker = CircuitBreaker::new(id.as_str(), registry.config.clone());
                breakers.insert(id, breaker);
            }
        }
        registry
    }

    /// Breaker for `provider`, registering a fresh one for unknown ids
    pub fn breaker(&self, provider: &str) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().get(provider) {
            return breaker.clone();
        }

        self.breakers
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(provider, self.config.clone()))
            .clone()
    }

    pub fn allow(&self, provider: &str) -> bool {
        self.breaker(provider).allow()
    }

    pub fn record_success(&self, provider: &str) {
        self.breaker(provider).record_success();
    }

    pub fn record_failure(&self, provider: &str) {
        self.breaker(provider).record_failure();
    }

    pub fn record_abandoned(&self, provider: &str) {
        self.breaker(provider).record_abandoned();
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.breaker(provider).state()
    }

    pub fn snapshot(&self, provider: &str) -> ProviderState {
        self.breaker(provider).snapshot()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
            max_reset_timeout: Duration::from_secs(15 * 60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_closed_to_open_on_consecutive_failures() {
        let cb = CircuitBreaker::new("vision", config(3));

        for _ in 0..3 {
            let _ = cb.call(|| async { Err::<(), _>("error") }).await;
        }

        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_counter() {
        let cb = CircuitBreaker::new("vision", config(3));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_admits_exactly_one_probe_after_reset_timeout() {
        let cb = CircuitBreaker::new("vision", config(2));
        cb.record_failure();
        cb.record_failure();

        assert!(!cb.allow());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.allow());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow());
        assert!(!cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_halfopen_to_closed_on_success() {
        let cb = CircuitBreaker::new("vision", config(2));
        cb.record_failure();
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allow());
        cb.record_success();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.reset_timeout, Duration::from_secs(60));
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_doubles_reset_timeout_up_to_cap() {
        let cb = CircuitBreaker::new(
            "vision",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                max_reset_timeout: Duration::from_secs(200),
            },
        );
        cb.record_failure();

        let mut expected = [120u64, 200, 200].into_iter();
        let mut wait = Duration::from_secs(60);
        for _ in 0..3 {
            tokio::time::advance(wait).await;
            assert!(cb.allow());
            cb.record_failure();

            let snapshot = cb.snapshot();
            assert_eq!(snapshot.state, CircuitState::Open);
            let next = Duration::from_secs(expected.next().unwrap());
            assert_eq!(snapshot.reset_timeout, next);
            wait = next;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let cb = CircuitBreaker::new("vision", config(1));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(cb.allow());
        assert!(!cb.allow());
        cb.record_abandoned();
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_isolates_providers() {
        let registry = CircuitBreakerRegistry::with_providers(config(2), ["a", "b"]);

        registry.record_failure("a");
        registry.record_failure("a");

        assert!(!registry.allow("a"));
        assert!(registry.allow("b"));
        assert_eq!(registry.snapshot("b").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_registers_unknown_provider_lazily() {
        let registry = CircuitBreakerRegistry::new(config(5));
        assert!(registry.allow("late-provider"));
        assert_eq!(registry.state("late-provider"), CircuitState::Closed);
    }
}
