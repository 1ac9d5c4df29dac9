//! Two-tier result cache for merged content analyses
//!
//! - Fast tier: in-process LRU bounded by item count and serialized bytes
//! - Durable tier: Redis (or an in-memory stand-in) that survives restarts
//!   and warms the fast tier on demand
//! - Lazy expiry on read plus a periodic sweep
//! - Separate TTLs for complete and partial results

mod clock;
mod entry;
mod error;
mod fast;
mod keys;
mod metrics;

pub mod durable;

pub use clock::{Clock, ManualClock, SystemClock};
pub use durable::{DurableStore, MemoryStore, RedisStore, SharedRedis};
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
pub use fast::{FastInsert, FastTier};
pub use keys::{CacheKey, CACHE_VERSION};
pub use metrics::CacheMetrics;

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default TTL values (seconds)
pub mod ttl {
    /// Every intended provider contributed
    pub const COMPLETE: u64 = 24 * 3600;
    /// Some provider failed or was skipped; short-lived so it gets retried
    pub const PARTIAL: u64 = 3600;
}

/// TTL policy keyed on result completeness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub complete: Duration,
    pub partial: Duration,
}

impl CacheTtl {
    pub fn for_result(&self, complete: bool) -> Duration {
        if complete {
            self.complete
        } else {
            self.partial
        }
    }
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            complete: Duration::from_secs(ttl::COMPLETE),
            partial: Duration::from_secs(ttl::PARTIAL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub fast_max_items: usize,
    pub fast_max_bytes: usize,
    pub ttl: CacheTtl,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_max_items: 10_000,
            fast_max_bytes: 64 * 1024 * 1024,
            ttl: CacheTtl::default(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Fast tier in front of a durable tier.
///
/// Reads never fail: durable-tier errors and corrupt payloads are logged,
/// counted and treated as misses.
pub struct ResultCache<V> {
    fast: FastTier<V>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
    config: CacheConfig,
    _value: PhantomData<fn() -> V>,
}

impl<V> ResultCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig, durable: Arc<dyn DurableStore>) -> Self {
        Self::with_clock(config, durable, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        durable: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fast: FastTier::new(config.fast_max_items, config.fast_max_bytes),
            durable,
            clock,
            metrics: CacheMetrics::new(),
            config,
            _value: PhantomData,
        }
    }

    pub fn ttl(&self) -> CacheTtl {
        self.config.ttl
    }

    /// Fetch `key`, checking the fast tier first and promoting durable hits
    pub async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now();

        if let Some(entry) = self.fast.get(key, now) {
            debug!(key = %key, tier = "fast", "Cache hit");
            self.metrics.record_hit(key, "fast");
            return Some(entry);
        }

        let payload = match self.durable.get(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                self.metrics.record_miss(key);
                return None;
            }
            Err(e) => {
                warn!(key = %key, backend = self.durable.name(), error = %e, "Durable tier get error");
                self.metrics.record_error(key, "durable_get");
                self.metrics.record_miss(key);
                return None;
            }
        };

        let entry: CacheEntry<V> = match serde_json::from_str(&payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache deserialization failed");
                self.metrics.record_error(key, "deserialize");
                // Delete corrupted cache entry
                let _ = self.durable.del(key).await;
                self.metrics.record_miss(key);
                return None;
            }
        };

        if entry.is_expired_at(now) {
            debug!(key = %key, "Durable entry expired");
            self.metrics.record_eviction("durable", "expired");
            let _ = self.durable.del(key).await;
            self.metrics.record_miss(key);
            return None;
        }

        debug!(key = %key, tier = "durable", "Cache hit, promoting");
        self.metrics.record_hit(key, "durable");
        self.insert_fast(&entry, payload.len());
        Some(entry)
    }

    /// Write to both tiers.
    ///
    /// Only serialization failures are returned; a durable-tier write error is
    /// logged and the fast tier still holds the value.
    pub async fn put(&self, key: &str, value: V, complete: bool, ttl: Duration) -> CacheResult<()> {
        let entry = CacheEntry::new(key, value, complete, self.clock.now(), ttl);
        let payload = serde_json::to_string(&entry)?;

        self.insert_fast(&entry, payload.len());

        match self.durable.set(key, payload, ttl).await {
            Ok(()) => {
                self.metrics.record_write(key, "durable");
                debug!(key = %key, ttl = ?ttl, complete, "Cache set");
            }
            Err(e) => {
                warn!(key = %key, backend = self.durable.name(), error = %e, "Durable tier set error");
                self.metrics.record_error(key, "durable_set");
            }
        }

        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.fast.remove(key);
        self.durable.del(key).await?;

        debug!(key = %key, "Cache invalidate");
        self.metrics.record_invalidation(key);
        Ok(())
    }

    /// Eagerly evict expired entries from both tiers
    pub async fn sweep_expired(&self) -> usize {
        let fast = self.fast.sweep(self.clock.now());
        self.metrics.record_evictions("fast", "expired", fast);

        let durable = match self.durable.sweep().await {
            Ok(count) => count,
            Err(e) => {
                warn!(backend = self.durable.name(), error = %e, "Durable tier sweep error");
                0
            }
        };
        self.metrics.record_evictions("durable", "expired", durable);

        if fast + durable > 0 {
            debug!(fast, durable, "Cache sweep evicted expired entries");
        }
        fast + durable
    }

    /// Run `sweep_expired` every `sweep_interval` until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep_expired().await;
                    }
                }
            }
        })
    }

    pub fn fast_len(&self) -> usize {
        self.fast.len()
    }

    fn insert_fast(&self, entry: &CacheEntry<V>, bytes: usize) {
        let outcome = self.fast.insert(entry.clone(), bytes);
        if outcome.stored {
            self.metrics.record_write(&entry.key, "fast");
        }
        self.metrics.record_evictions("fast", "capacity", outcome.evicted);
    }
}
