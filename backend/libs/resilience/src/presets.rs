/// Preset configurations for the call sites the analysis platform protects
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for a service type
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: Option<RetryConfig>,
}

/// Hosted content-analysis providers (vision APIs, face indexes)
///
/// - Timeout: 3s per call
/// - Circuit breaker: 5 failures, 60s reset doubling up to 15min
/// - Retry: 3 attempts, 500ms base backoff capped at 8s
pub fn analysis_provider_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(3),
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            max_reset_timeout: Duration::from_secs(15 * 60),
        },
        retry: Some(RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: true,
        }),
    }
}

/// Durable cache tier (Redis)
///
/// - Timeout: 500ms
/// - Circuit breaker: 3 failures, 15s reset
/// - No retry: cache reads fall through to providers
pub fn redis_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_millis(500),
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
            max_reset_timeout: Duration::from_secs(120),
        },
        retry: None,
    }
}
