//! Configuration for the analysis service
use crate::jobs::BatchSettings;
use crate::orchestrator::OrchestratorConfig;
use crate::providers::VisionSettings;
use crate::services::merger::{ConfidenceWeighting, MergerConfig};
use analysis_cache::{CacheConfig, CacheTtl};
use resilience::{CircuitBreakerConfig, RetryConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration struct, loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // ============================================
    // Providers
    // ============================================
    /// Comma-separated provider ids in priority order
    #[serde(default = "default_provider_order")]
    pub provider_order: String,

    /// Optional comma-separated `provider=weight` pairs for confidence weighting
    #[serde(default)]
    pub provider_weights: String,

    /// Google Cloud Vision API key (optional, uses ADC if not set)
    #[serde(default)]
    pub google_vision_api_key: String,

    /// Use Application Default Credentials instead of API key
    #[serde(default)]
    pub use_adc: bool,

    /// Maximum tags a provider reports per item
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Minimum raw score for a provider tag
    #[serde(default = "default_min_tag_confidence")]
    pub min_tag_confidence: f64,

    // ============================================
    // Resilience
    // ============================================
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_reset_timeout_secs")]
    pub breaker_reset_timeout_secs: u64,

    #[serde(default = "default_breaker_max_reset_timeout_secs")]
    pub breaker_max_reset_timeout_secs: u64,

    // ============================================
    // Merging
    // ============================================
    #[serde(default = "default_verification_threshold")]
    pub verification_threshold: f64,

    #[serde(default = "default_face_iou_threshold")]
    pub face_iou_threshold: f64,

    // ============================================
    // Cache
    // ============================================
    /// Redis URL for the durable tier; in-memory when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_cache_fast_max_items")]
    pub cache_fast_max_items: usize,

    #[serde(default = "default_cache_fast_max_bytes")]
    pub cache_fast_max_bytes: usize,

    #[serde(default = "default_cache_durable_max_entries")]
    pub cache_durable_max_entries: usize,

    #[serde(default = "default_cache_durable_max_bytes")]
    pub cache_durable_max_bytes: usize,

    #[serde(default = "default_cache_complete_ttl_secs")]
    pub cache_complete_ttl_secs: u64,

    #[serde(default = "default_cache_partial_ttl_secs")]
    pub cache_partial_ttl_secs: u64,

    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,

    // ============================================
    // Batch mode
    // ============================================
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Delay between batches in milliseconds
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_provider_order() -> String {
    "vision_global,vision_eu,vision_us".to_string()
}

fn default_max_tags() -> usize {
    15
}

fn default_min_tag_confidence() -> f64 {
    0.3
}

fn default_provider_timeout_ms() -> u64 {
    3_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8_000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_reset_timeout_secs() -> u64 {
    60
}

fn default_breaker_max_reset_timeout_secs() -> u64 {
    15 * 60
}

fn default_verification_threshold() -> f64 {
    0.98
}

fn default_face_iou_threshold() -> f64 {
    0.5
}

fn default_cache_fast_max_items() -> usize {
    10_000
}

fn default_cache_fast_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cache_durable_max_entries() -> usize {
    100_000
}

fn default_cache_durable_max_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_cache_complete_ttl_secs() -> u64 {
    analysis_cache::ttl::COMPLETE
}

fn default_cache_partial_ttl_secs() -> u64 {
    analysis_cache::ttl::PARTIAL
}

fn default_cache_sweep_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_concurrency() -> usize {
    4
}

fn default_batch_delay_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_order: default_provider_order(),
            provider_weights: String::new(),
            google_vision_api_key: String::new(),
            use_adc: false,
            max_tags: default_max_tags(),
            min_tag_confidence: default_min_tag_confidence(),
            provider_timeout_ms: default_provider_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_reset_timeout_secs: default_breaker_reset_timeout_secs(),
            breaker_max_reset_timeout_secs: default_breaker_max_reset_timeout_secs(),
            verification_threshold: default_verification_threshold(),
            face_iou_threshold: default_face_iou_threshold(),
            redis_url: None,
            cache_fast_max_items: default_cache_fast_max_items(),
            cache_fast_max_bytes: default_cache_fast_max_bytes(),
            cache_durable_max_entries: default_cache_durable_max_entries(),
            cache_durable_max_bytes: default_cache_durable_max_bytes(),
            cache_complete_ttl_secs: default_cache_complete_ttl_secs(),
            cache_partial_ttl_secs: default_cache_partial_ttl_secs(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            batch_size: default_batch_size(),
            batch_concurrency: default_batch_concurrency(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Config = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_ids().is_empty() {
            return Err(invalid("PROVIDER_ORDER", "at least one provider is required"));
        }
        self.weighting()?;

        for (field, value) in [
            ("VERIFICATION_THRESHOLD", self.verification_threshold),
            ("FACE_IOU_THRESHOLD", self.face_iou_threshold),
            ("MIN_TAG_CONFIDENCE", self.min_tag_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{} is outside [0, 1]", value)));
            }
        }

        if self.provider_timeout_ms == 0 {
            return Err(invalid("PROVIDER_TIMEOUT_MS", "must be positive"));
        }
        if self.retry_max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                "must not be below RETRY_BASE_DELAY_MS",
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(invalid("BREAKER_FAILURE_THRESHOLD", "must be at least 1"));
        }
        if self.breaker_max_reset_timeout_secs < self.breaker_reset_timeout_secs {
            return Err(invalid(
                "BREAKER_MAX_RESET_TIMEOUT_SECS",
                "must not be below BREAKER_RESET_TIMEOUT_SECS",
            ));
        }
        if self.cache_fast_max_items == 0 {
            return Err(invalid("CACHE_FAST_MAX_ITEMS", "must be at least 1"));
        }
        if self.cache_complete_ttl_secs == 0 || self.cache_partial_ttl_secs == 0 {
            return Err(invalid("CACHE_*_TTL_SECS", "TTLs must be positive"));
        }
        if self.cache_sweep_interval_secs == 0 {
            return Err(invalid("CACHE_SWEEP_INTERVAL_SECS", "must be positive"));
        }
        if self.batch_concurrency == 0 || self.batch_size == 0 {
            return Err(invalid("BATCH_*", "batch size and concurrency must be at least 1"));
        }

        Ok(())
    }

    /// Provider ids in priority order, duplicates dropped
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.provider_order.split(',').map(str::trim) {
            if !id.is_empty() && !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    pub fn weighting(&self) -> Result<ConfidenceWeighting, ConfigError> {
        if self.provider_weights.trim().is_empty() {
            return Ok(ConfidenceWeighting::Equal);
        }

        let mut weights = HashMap::new();
        for pair in self.provider_weights.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (provider, weight) = pair
                .split_once('=')
                .ok_or_else(|| invalid("PROVIDER_WEIGHTS", format!("'{}' is not provider=weight", pair)))?;
            let weight: f64 = weight
                .trim()
                .parse()
                .map_err(|_| invalid("PROVIDER_WEIGHTS", format!("'{}' has a non-numeric weight", pair)))?;
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(
                    "PROVIDER_WEIGHTS",
                    format!("'{}' must be a non-negative number", pair),
                ));
            }
            weights.insert(provider.trim().to_string(), weight);
        }
        Ok(ConfidenceWeighting::ByProvider(weights))
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_timeout: Duration::from_secs(self.breaker_reset_timeout_secs),
            max_reset_timeout: Duration::from_secs(self.breaker_max_reset_timeout_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_base_delay_ms),
            max_backoff: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            per_call_timeout: Duration::from_millis(self.provider_timeout_ms),
            retry: self.retry_config(),
        }
    }

    pub fn merger_config(&self) -> Result<MergerConfig, ConfigError> {
        Ok(MergerConfig {
            verification_threshold: self.verification_threshold,
            face_iou_threshold: self.face_iou_threshold,
            weighting: self.weighting()?,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            fast_max_items: self.cache_fast_max_items,
            fast_max_bytes: self.cache_fast_max_bytes,
            ttl: CacheTtl {
                complete: Duration::from_secs(self.cache_complete_ttl_secs),
                partial: Duration::from_secs(self.cache_partial_ttl_secs),
            },
            sweep_interval: Duration::from_secs(self.cache_sweep_interval_secs),
        }
    }

    pub fn vision_settings(&self) -> VisionSettings {
        VisionSettings {
            max_tags: self.max_tags,
            min_tag_score: self.min_tag_confidence,
            ..VisionSettings::default()
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size,
            concurrency: self.batch_concurrency,
            batch_delay: Duration::from_millis(self.batch_delay_ms),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
