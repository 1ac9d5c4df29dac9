/// Integration tests for resilience library
use resilience::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState},
    presets,
    retry::{with_retry, RetryConfig, RetryError, RetryPolicy, Transient},
    timeout::with_timeout,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
enum CallError {
    Timeout,
    Rejected,
}

impl Transient for CallError {
    fn is_transient(&self) -> bool {
        matches!(self, CallError::Timeout)
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Timeout => write!(f, "timed out"),
            CallError::Rejected => write!(f, "rejected"),
        }
    }
}

// ==================== Circuit Breaker Tests ====================

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_full_lifecycle() {
    let config = CircuitBreakerConfig {
        failure_threshold: 5,
        reset_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let cb = CircuitBreaker::new("primary", config);

    // Phase 1: Closed -> Open after exactly 5 failures
    for i in 0..5 {
        assert!(cb.allow(), "call {} should be admitted", i);
        cb.record_failure();
    }
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(!cb.allow());

    // Phase 2: Open -> HalfOpen once the reset timeout elapses, one probe only
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(cb.allow());
    assert!(!cb.allow());
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    // Phase 3: HalfOpen -> Closed on probe success
    cb.record_success();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert!(cb.allow());
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_repeated_probe_failures_back_off() {
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(10),
        max_reset_timeout: Duration::from_secs(30),
    };
    let cb = CircuitBreaker::new("primary", config);
    cb.record_failure();
    cb.record_failure();

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(cb.allow());
    cb.record_failure();

    // Reset timeout is now 20s: 10s later the circuit is still open
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(!cb.allow());
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(cb.allow());
    cb.record_failure();

    // Capped at 30s
    assert_eq!(cb.snapshot().reset_timeout, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_registry_breakers_are_independent() {
    let registry = CircuitBreakerRegistry::with_providers(
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        },
        ["primary", "secondary", "tertiary"],
    );

    registry.record_failure("primary");

    assert_eq!(registry.state("primary"), CircuitState::Open);
    assert_eq!(registry.state("secondary"), CircuitState::Closed);
    assert_eq!(registry.state("tertiary"), CircuitState::Closed);
}

// ==================== Timeout Tests ====================

#[tokio::test]
async fn test_timeout_success() {
    let result = with_timeout(Duration::from_secs(1), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        42
    })
    .await;

    assert_eq!(tokio_test::assert_ok!(result), 42);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_elapsed() {
    let result = with_timeout(Duration::from_millis(50), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        42
    })
    .await;

    tokio_test::assert_err!(result);
}

// ==================== Retry Tests ====================

#[tokio::test(start_paused = true)]
async fn test_retry_exponential_backoff_timing() {
    let policy = RetryPolicy::new(RetryConfig {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
        ..Default::default()
    });

    let start = tokio::time::Instant::now();

    let result = with_retry(&policy, &CancellationToken::new(), |_| async {
        Err::<i32, _>(CallError::Timeout)
    })
    .await;

    // 50ms + 100ms + 200ms between four attempts
    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
    assert!(start.elapsed() >= Duration::from_millis(350));
}

#[tokio::test]
async fn test_retry_stops_on_permanent_error() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let result = with_retry(&RetryPolicy::default(), &CancellationToken::new(), move |attempt| {
        counter_clone.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 1 {
                Err::<i32, _>(CallError::Rejected)
            } else {
                Ok(1)
            }
        }
    })
    .await;

    assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_in_flight_attempt() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = with_retry(&RetryPolicy::default(), &cancel, |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, CallError>(1)
    })
    .await;

    assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
}

// ==================== Preset Configuration Tests ====================

#[test]
fn test_analysis_provider_config_values() {
    let config = presets::analysis_provider_config();
    assert_eq!(config.timeout.duration, Duration::from_secs(3));
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(60));
    assert_eq!(config.circuit_breaker.max_reset_timeout, Duration::from_secs(900));
    assert_eq!(config.retry.unwrap().initial_backoff, Duration::from_millis(500));
}

// ==================== Combined Scenario Tests ====================

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_count_once_toward_breaker() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
    let policy = RetryPolicy::new(RetryConfig {
        initial_backoff: Duration::from_millis(10),
        jitter: false,
        ..Default::default()
    });

    assert!(registry.allow("primary"));
    let result = with_retry(&policy, &CancellationToken::new(), |_| async {
        with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await
        .map_err(|_| CallError::Timeout)
    })
    .await;

    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    registry.record_failure("primary");

    let snapshot = registry.snapshot("primary");
    assert_eq!(snapshot.consecutive_failures, 1);
    assert_eq!(snapshot.state, CircuitState::Closed);
}
