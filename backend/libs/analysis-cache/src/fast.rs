//! In-process LRU tier bounded by item count and serialized byte size

use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

struct Slot<V> {
    entry: CacheEntry<V>,
    bytes: usize,
}

struct Inner<V> {
    lru: LruCache<String, Slot<V>>,
    total_bytes: usize,
}

/// What happened to a fast-tier insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastInsert {
    pub stored: bool,
    pub evicted: usize,
}

pub struct FastTier<V> {
    inner: Mutex<Inner<V>>,
    max_bytes: usize,
}

impl<V: Clone> FastTier<V> {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_items.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Look up `key`; an expired entry is removed and reported as a miss
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<V>> {
        let mut inner = self.inner.lock();

        let expired = match inner.lru.get(key) {
            Some(slot) if !slot.entry.is_expired_at(now) => return Some(slot.entry.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(slot) = inner.lru.pop(key) {
                inner.total_bytes -= slot.bytes;
            }
        }
        None
    }

    pub fn insert(&self, entry: CacheEntry<V>, bytes: usize) -> FastInsert {
        let mut inner = self.inner.lock();

        if let Some(old) = inner.lru.pop(&entry.key) {
            inner.total_bytes -= old.bytes;
        }

        if bytes > self.max_bytes {
            return FastInsert {
                stored: false,
                evicted: 0,
            };
        }

        let mut evicted = 0;
        while inner.total_bytes + bytes > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, slot)) => {
                    inner.total_bytes -= slot.bytes;
                    evicted += 1;
                }
                None => break,
            }
        }

        let key = entry.key.clone();
        if let Some((_, displaced)) = inner.lru.push(key, Slot { entry, bytes }) {
            inner.total_bytes -= displaced.bytes;
            evicted += 1;
        }
        inner.total_bytes += bytes;

        FastInsert {
            stored: true,
            evicted,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.lru.pop(key) {
            Some(slot) => {
                inner.total_bytes -= slot.bytes;
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .lru
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(slot) = inner.lru.pop(key) {
                inner.total_bytes -= slot.bytes;
            }
        }

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}
