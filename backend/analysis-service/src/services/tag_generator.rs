//! Tag normalization and ranking
//!
//! `normalize_tag` is the single canonical form for tags and scene labels;
//! the merger relies on it for case-insensitive deduplication. Ranking is
//! used by adapters that derive tags from several weighted signals.
use std::collections::HashMap;

/// Where a tag candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    Label,
    Object,
    WebEntity,
    BestGuess,
    Landmark,
}

impl TagSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagSource::Label => "label",
            TagSource::Object => "object",
            TagSource::WebEntity => "web_entity",
            TagSource::BestGuess => "best_guess",
            TagSource::Landmark => "landmark",
        }
    }

    /// Multiplier applied to the raw score; earlier sources win ties
    fn weight(&self) -> f64 {
        match self {
            TagSource::Label => 1.0,
            TagSource::Object => 0.9,
            TagSource::Landmark => 0.9,
            TagSource::WebEntity => 0.8,
            TagSource::BestGuess => 0.7,
        }
    }
}

/// Raw signal from a provider response
#[derive(Debug, Clone)]
pub struct TagCandidate {
    pub name: String,
    pub score: f64,
    pub source: TagSource,
}

impl TagCandidate {
    pub fn new(name: impl Into<String>, score: f64, source: TagSource) -> Self {
        Self {
            name: name.into(),
            score,
            source,
        }
    }
}

/// A tag that survived filtering
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTag {
    pub tag: String,
    pub confidence: f64,
    pub source: TagSource,
}

/// Tags that carry no information for a family library
const TAG_BLOCKLIST: &[&str] = &[
    "image",
    "photo",
    "picture",
    "screenshot",
    "snapshot",
    "photography",
    "photograph",
    "person",
    "people",
    "human",
    "face",
    "day",
    "night",
    "indoor",
    "outdoor",
    "daytime",
    "close up",
    "closeup",
    "background",
    "foreground",
    "vertical",
    "horizontal",
];

/// Canonical form: lowercase, `_`/`-` as spaces, whitespace collapsed
pub fn normalize_tag(tag: &str) -> String {
    tag.to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Length, blocklist and numeric checks on an already normalized tag
pub fn is_valid_tag(tag: &str) -> bool {
    let len = tag.chars().count();
    if !(2..=50).contains(&len) {
        return false;
    }

    if TAG_BLOCKLIST.contains(&tag) {
        return false;
    }

    !tag.chars().all(|c| c.is_numeric() || c.is_whitespace())
}

/// Normalize, filter and rank candidates.
///
/// Candidates below `min_score` (before weighting) are dropped. When the
/// same tag arrives from several sources the best weighted score is kept.
/// The result is sorted by confidence descending and truncated to `max_tags`.
pub fn rank_tags<I>(candidates: I, max_tags: usize, min_score: f64) -> Vec<RankedTag>
where
    I: IntoIterator<Item = TagCandidate>,
{
    let mut by_tag: HashMap<String, (usize, RankedTag)> = HashMap::new();

    for (position, candidate) in candidates.into_iter().enumerate() {
        if !candidate.score.is_finite() || candidate.score < min_score {
            continue;
        }

        let tag = normalize_tag(&candidate.name);
        if !is_valid_tag(&tag) {
            continue;
        }

        let confidence = (candidate.score * candidate.source.weight()).clamp(0.0, 1.0);
        by_tag
            .entry(tag.clone())
            .and_modify(|(_, existing)| {
                if confidence > existing.confidence {
                    existing.confidence = confidence;
                    existing.source = candidate.source;
                }
            })
            .or_insert((
                position,
                RankedTag {
                    tag,
                    confidence,
                    source: candidate.source,
                },
            ));
    }

    let mut ranked: Vec<(usize, RankedTag)> = by_tag.into_values().collect();
    ranked.sort_by(|(pos_a, a), (pos_b, b)| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(pos_a.cmp(pos_b))
    });
    ranked.truncate(max_tags);

    ranked.into_iter().map(|(_, tag)| tag).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("Hello World"), "hello world");
        assert_eq!(normalize_tag("street_style"), "street style");
        assert_eq!(normalize_tag("  Birthday-Party  "), "birthday party");
        assert_eq!(normalize_tag("   "), "");
    }

    #[test]
    fn test_is_valid_tag() {
        assert!(is_valid_tag("beach"));
        assert!(is_valid_tag("birthday party"));
        assert!(!is_valid_tag("a"));
        assert!(!is_valid_tag("photo"));
        assert!(!is_valid_tag("2024"));
    }

    #[test]
    fn test_rank_tags_filters_and_sorts() {
        let tags = rank_tags(
            vec![
                TagCandidate::new("Dog", 0.95, TagSource::Label),
                TagCandidate::new("Grass", 0.2, TagSource::Label),
                TagCandidate::new("Frisbee", 0.9, TagSource::Object),
                TagCandidate::new("Photo", 0.99, TagSource::Label),
            ],
            10,
            0.3,
        );

        let names: Vec<&str> = tags.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["dog", "frisbee"]);
        assert!((tags[1].confidence - 0.81).abs() < 1e-9);
    }

    #[test]
    fn test_rank_tags_keeps_best_source_per_tag() {
        let tags = rank_tags(
            vec![
                TagCandidate::new("beach", 0.6, TagSource::WebEntity),
                TagCandidate::new("Beach", 0.9, TagSource::Label),
            ],
            10,
            0.3,
        );

        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].source, TagSource::Label);
        assert!((tags[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_rank_tags_truncates() {
        let candidates = (0..20).map(|i| TagCandidate::new(format!("tag{}", i), 0.9, TagSource::Label));
        assert_eq!(rank_tags(candidates, 5, 0.3).len(), 5);
    }
}
