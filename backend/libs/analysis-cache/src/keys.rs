//! Unified cache key schema
//!
//! Key format: v{VERSION}:{entity}:{identifier}[:sub_key]

/// Cache schema version - increment when changing key formats or the entry layout
pub const CACHE_VERSION: u32 = 1;

/// Cache key builder
pub struct CacheKey;

impl CacheKey {
    /// Merged analysis for one content item and one capability fingerprint
    /// Format: v1:analysis:{content_id}:{fingerprint}
    pub fn analysis(content_id: &str, fingerprint: &str) -> String {
        format!("v{}:analysis:{}:{}", CACHE_VERSION, content_id, fingerprint)
    }

    /// Analysis produced under a caller-supplied confidence threshold.
    /// Format: v1:analysis:{content_id}:{fingerprint}:min{threshold}
    pub fn analysis_at(content_id: &str, fingerprint: &str, threshold: f64) -> String {
        format!("{}:min{}", Self::analysis(content_id, fingerprint), threshold)
    }

    /// Entity segment of a key, used as a metrics label
    pub fn entity(key: &str) -> &str {
        key.split(':').nth(1).unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_key() {
        assert_eq!(
            CacheKey::analysis("photo-123", "faces+tags"),
            "v1:analysis:photo-123:faces+tags"
        );
    }

    #[test]
    fn test_threshold_key_differs_from_default() {
        let key = CacheKey::analysis_at("photo-123", "faces+tags", 0.5);
        assert_eq!(key, "v1:analysis:photo-123:faces+tags:min0.5");
        assert_ne!(key, CacheKey::analysis("photo-123", "faces+tags"));
        assert_eq!(CacheKey::entity(&key), "analysis");
    }

    #[test]
    fn test_entity_extraction() {
        assert_eq!(CacheKey::entity("v1:analysis:photo-123:tags"), "analysis");
        assert_eq!(CacheKey::entity("garbage"), "unknown");
    }
}
