//! Resilience patterns for calling unreliable analysis providers
//!
//! This library provides:
//! - **Circuit Breaker**: Per-provider health gate with a single-probe HalfOpen state
//!   and exponential reopen backoff
//! - **Retry**: Exponential backoff with jitter for transient failures, cancellable
//! - **Timeout**: Enforces time limits on external calls
//! - **Preset Configurations**: Pre-tuned settings for analysis providers and Redis
//!
//! # Example: gating a provider call
//!
//! ```rust,no_run
//! use resilience::{presets, CircuitBreakerRegistry};
//!
//! let config = presets::analysis_provider_config();
//! let breakers = CircuitBreakerRegistry::with_providers(config.circuit_breaker, ["vision"]);
//!
//! if breakers.allow("vision") {
//!     // call the provider, then report the outcome
//!     breakers.record_success("vision");
//! }
//! ```
//!
//! # Example: retrying a transient failure
//!
//! ```rust,no_run
//! use resilience::{with_retry, RetryPolicy, Transient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl Transient for Flaky {
//!     fn is_transient(&self) -> bool { true }
//! }
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "flaky") }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::default();
//!     let cancel = CancellationToken::new();
//!     let result = with_retry(&policy, &cancel, |_attempt| async { Ok::<_, Flaky>(()) }).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod circuit_breaker;
pub mod metrics;
pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState, ProviderState,
};
pub use presets::{analysis_provider_config, redis_config, ServiceConfig};
pub use retry::{with_retry, RetryConfig, RetryError, RetryPolicy, Transient};
pub use timeout::{with_timeout, TimeoutConfig, TimeoutError};
