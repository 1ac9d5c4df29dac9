//! Cached value envelope shared by both tiers

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached value plus the bookkeeping needed to decide freshness.
///
/// `complete` records whether every intended contributor succeeded; partial
/// entries are served only as a fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub complete: bool,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn new(
        key: impl Into<String>,
        value: V,
        complete: bool,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500));
        Self {
            key: key.into(),
            value,
            complete,
            inserted_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime, zero once expired
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", 1u8, true, now, std::time::Duration::from_secs(60));

        assert!(!entry.is_expired_at(now));
        assert!(!entry.is_expired_at(now + Duration::seconds(59)));
        assert!(entry.is_expired_at(now + Duration::seconds(60)));
        assert_eq!(
            entry.remaining_ttl(now + Duration::seconds(20)),
            std::time::Duration::from_secs(40)
        );
        assert_eq!(
            entry.remaining_ttl(now + Duration::seconds(90)),
            std::time::Duration::ZERO
        );
    }
}
