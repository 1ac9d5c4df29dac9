//! Durable tier backends
//!
//! The durable tier survives process restarts and is the warm-start source
//! for the fast tier. Payloads are opaque JSON strings; TTL enforcement is
//! delegated to the backend.

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use resilience::with_timeout;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Shared Redis connection manager
pub type SharedRedis = Arc<AsyncMutex<ConnectionManager>>;

/// Key/value store with TTL support
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> CacheResult<()>;

    async fn del(&self, key: &str) -> CacheResult<()>;

    /// Eagerly drop expired entries. Backends with native expiry return 0.
    async fn sweep(&self) -> CacheResult<usize> {
        Ok(0)
    }

    fn name(&self) -> &'static str;
}

/// Redis-backed durable tier
///
/// Size is bounded by the Redis `maxmemory` policy plus a per-value cap
/// enforced here.
pub struct RedisStore {
    redis: SharedRedis,
    op_timeout: Duration,
    max_value_bytes: usize,
}

impl RedisStore {
    pub fn new(redis: SharedRedis, max_value_bytes: usize) -> Self {
        Self {
            redis,
            op_timeout: resilience::redis_config().timeout.duration,
            max_value_bytes,
        }
    }

    pub async fn connect(redis_url: &str, max_value_bytes: usize) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self::new(Arc::new(AsyncMutex::new(manager)), max_value_bytes))
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.redis.lock().await;
        let value = with_timeout(self.op_timeout, conn.get::<_, Option<String>>(key)).await??;
        Ok(value)
    }

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> CacheResult<()> {
        if payload.len() > self.max_value_bytes {
            return Err(CacheError::TooLarge {
                size: payload.len(),
                limit: self.max_value_bytes,
            });
        }

        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.redis.lock().await;
        with_timeout(
            self.op_timeout,
            conn.set_ex::<_, _, ()>(key, payload, ttl_secs),
        )
        .await??;

        debug!(key = %key, ttl = ttl_secs, "Durable set");
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.redis.lock().await;
        with_timeout(self.op_timeout, conn.del::<_, ()>(key)).await??;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct MemorySlot {
    payload: String,
    expires_at: DateTime<Utc>,
}

/// In-process durable tier for local runs and tests.
///
/// Bounded by entry count and total payload bytes; when full, the entry
/// closest to expiry is dropped first.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemorySlot>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryStore {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self::with_clock(max_entries, max_bytes, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: usize, max_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn total_bytes(entries: &HashMap<String, MemorySlot>) -> usize {
        entries.values().map(|slot| slot.payload.len()).sum()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(slot) if now < slot.expires_at => Ok(Some(slot.payload.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> CacheResult<()> {
        if payload.len() > self.max_bytes {
            return Err(CacheError::TooLarge {
                size: payload.len(),
                limit: self.max_bytes,
            });
        }

        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::InvalidData(format!("ttl out of range: {}", e)))?;
        let mut entries = self.entries.lock();
        entries.remove(key);

        entries.retain(|_, slot| now < slot.expires_at);
        while entries.len() >= self.max_entries
            || Self::total_bytes(&entries) + payload.len() > self.max_bytes
        {
            let victim = entries
                .iter()
                .min_by_key(|(_, slot)| slot.expires_at)
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim) => {
                    entries.remove(&victim);
                }
                None => break,
            }
        }

        entries.insert(
            key.to_string(),
            MemorySlot {
                payload,
                expires_at: now.checked_add_signed(ttl).unwrap_or(now),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn sweep(&self) -> CacheResult<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, slot| now < slot.expires_at);
        Ok(before - entries.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
