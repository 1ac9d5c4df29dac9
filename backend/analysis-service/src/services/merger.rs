//! Folds provider results into one canonical analysis per content item
use crate::model::{AIAnalysis, Contribution, DetectedFace, ProviderResult};
use crate::services::tag_generator::normalize_tag;
use std::collections::HashMap;
use tracing::debug;

/// Below this merged confidence an analysis is flagged for human review
pub const DEFAULT_VERIFICATION_THRESHOLD: f64 = 0.98;

/// Faces overlapping more than this are the same face
pub const DEFAULT_FACE_IOU_THRESHOLD: f64 = 0.5;

/// How per-provider confidences combine into the merged confidence
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConfidenceWeighting {
    /// Arithmetic mean across contributing providers
    #[default]
    Equal,
    /// Weighted mean; providers without an entry weigh 1.0
    ByProvider(HashMap<String, f64>),
}

impl ConfidenceWeighting {
    fn weight(&self, provider: &str) -> f64 {
        match self {
            ConfidenceWeighting::Equal => 1.0,
            ConfidenceWeighting::ByProvider(weights) => weights
                .get(provider)
                .copied()
                .filter(|w| w.is_finite() && *w >= 0.0)
                .unwrap_or(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergerConfig {
    pub verification_threshold: f64,
    pub face_iou_threshold: f64,
    pub weighting: ConfidenceWeighting,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            verification_threshold: DEFAULT_VERIFICATION_THRESHOLD,
            face_iou_threshold: DEFAULT_FACE_IOU_THRESHOLD,
            weighting: ConfidenceWeighting::Equal,
        }
    }
}

/// Result of a merge
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(AIAnalysis),
    /// The provider already contributed something at least as recent;
    /// carries the analysis unchanged
    Stale(AIAnalysis),
}

impl MergeOutcome {
    pub fn is_stale(&self) -> bool {
        matches!(self, MergeOutcome::Stale(_))
    }

    pub fn into_analysis(self) -> AIAnalysis {
        match self {
            MergeOutcome::Merged(analysis) | MergeOutcome::Stale(analysis) => analysis,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultMerger {
    config: MergerConfig,
}

impl ResultMerger {
    pub fn new(config: MergerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    /// Merge using the configured verification threshold
    pub fn merge(&self, existing: AIAnalysis, incoming: ProviderResult) -> MergeOutcome {
        self.merge_with_threshold(existing, incoming, self.config.verification_threshold)
    }

    /// Merge `incoming` into `existing`, flagging against `threshold`
    pub fn merge_with_threshold(
        &self,
        mut analysis: AIAnalysis,
        incoming: ProviderResult,
        threshold: f64,
    ) -> MergeOutcome {
        let provider = incoming.provider_id.clone();

        if let Some(previous) = analysis.contributions.get(&provider) {
            if previous.timestamp >= incoming.timestamp {
                debug!(
                    content_id = %analysis.content_id,
                    provider = %provider,
                    stored = %previous.timestamp,
                    incoming = %incoming.timestamp,
                    "Ignoring stale provider result"
                );
                return MergeOutcome::Stale(analysis);
            }
        }

        union_labels(&mut analysis.tags, &incoming.tags);
        union_labels(&mut analysis.scenes, &incoming.scenes);
        self.merge_faces(&mut analysis.faces, incoming.faces);

        analysis.contributions.insert(
            provider.clone(),
            Contribution {
                confidence: clamp_unit(incoming.confidence),
                timestamp: incoming.timestamp,
            },
        );
        if !analysis.contributors.contains(&provider) {
            analysis.contributors.push(provider.clone());
        }
        analysis.provider_metadata.insert(provider, incoming.metadata);
        analysis.capabilities = analysis.capabilities.union(incoming.capabilities);
        if incoming.timestamp > analysis.updated_at {
            analysis.updated_at = incoming.timestamp;
        }

        analysis.confidence = self.combined_confidence(&analysis);
        analysis.requires_manual_verification =
            needs_verification(analysis.confidence, analysis.contributors.len(), threshold);

        MergeOutcome::Merged(analysis)
    }

    fn combined_confidence(&self, analysis: &AIAnalysis) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (provider, contribution) in &analysis.contributions {
            let weight = self.config.weighting.weight(provider);
            weighted += weight * contribution.confidence;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            return clamp_unit(weighted / total_weight);
        }

        // Every provider weighted to zero: fall back to the plain mean
        let count = analysis.contributions.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = analysis.contributions.values().map(|c| c.confidence).sum();
        clamp_unit(sum / count as f64)
    }

    fn merge_faces(&self, faces: &mut Vec<DetectedFace>, incoming: Vec<DetectedFace>) {
        // Incoming faces are only matched against faces from earlier merges
        let known = faces.len();

        for mut face in incoming {
            face.confidence = clamp_unit(face.confidence);

            let duplicate = faces[..known].iter_mut().find(|existing| {
                existing.bounding_box.iou(&face.bounding_box) > self.config.face_iou_threshold
                    && identities_agree(existing, &face)
            });

            match duplicate {
                Some(existing) => {
                    existing.confidence = clamp_unit((existing.confidence + face.confidence) / 2.0);
                    if existing.person_id.is_none() {
                        existing.person_id = face.person_id;
                    }
                }
                None => faces.push(face),
            }
        }
    }
}

/// Verification flag rule shared by merges and cache fallbacks
pub fn needs_verification(confidence: f64, contributors: usize, threshold: f64) -> bool {
    contributors == 0 || confidence < threshold
}

fn identities_agree(a: &DetectedFace, b: &DetectedFace) -> bool {
    match (&a.person_id, &b.person_id) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn union_labels(existing: &mut Vec<String>, incoming: &[String]) {
    for label in incoming {
        let normalized = normalize_tag(label);
        if normalized.is_empty() || existing.contains(&normalized) {
            continue;
        }
        existing.push(normalized);
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingBox, Capability, CapabilitySet, ProviderMetadata};
    use chrono::{Duration, TimeZone, Utc};

    fn t(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tags_result(provider: &str, confidence: f64, tags: &[&str]) -> ProviderResult {
        ProviderResult::new(provider, CapabilitySet::of(&[Capability::Tags]), confidence)
            .with_tags(tags.iter().copied())
            .at(t(0))
    }

    fn face(x: f64, confidence: f64) -> DetectedFace {
        DetectedFace::new(BoundingBox::new(x, 0.0, 100.0, 100.0), confidence)
    }

    #[test]
    fn test_first_merge_takes_provider_confidence() {
        let merger = ResultMerger::default();
        let merged = merger
            .merge(AIAnalysis::empty("c1"), tags_result("a", 0.995, &["Beach"]))
            .into_analysis();

        assert_eq!(merged.tags, vec!["beach"]);
        assert_eq!(merged.contributors, vec!["a"]);
        assert!((merged.confidence - 0.995).abs() < 1e-9);
        assert!(!merged.requires_manual_verification);
    }

    #[test]
    fn test_tags_union_is_case_insensitive_and_ordered() {
        let merger = ResultMerger::default();
        let analysis = merger
            .merge(AIAnalysis::empty("c1"), tags_result("a", 0.9, &["Dog", "park"]))
            .into_analysis();
        let analysis = merger
            .merge(analysis, tags_result("b", 0.9, &["DOG", "Frisbee", "  "]))
            .into_analysis();

        assert_eq!(analysis.tags, vec!["dog", "park", "frisbee"]);
    }

    #[test]
    fn test_equal_weighting_is_arithmetic_mean() {
        let merger = ResultMerger::default();
        let analysis = merger
            .merge(AIAnalysis::empty("c1"), tags_result("b", 0.9, &["dog"]))
            .into_analysis();
        let faces = ProviderResult::new("c", CapabilitySet::of(&[Capability::Faces]), 0.99)
            .with_faces(vec![face(0.0, 0.99)])
            .at(t(0));
        let analysis = merger.merge(analysis, faces).into_analysis();

        assert!((analysis.confidence - 0.945).abs() < 1e-9);
        assert!(analysis.requires_manual_verification);
        assert_eq!(analysis.contributors, vec!["b", "c"]);
        assert!(analysis
            .capabilities
            .contains_all(CapabilitySet::of(&[Capability::Tags, Capability::Faces])));
    }

    #[test]
    fn test_by_provider_weighting() {
        let mut weights = HashMap::new();
        weights.insert("trusted".to_string(), 3.0);
        let merger = ResultMerger::new(MergerConfig {
            weighting: ConfidenceWeighting::ByProvider(weights),
            ..MergerConfig::default()
        });

        let analysis = merger
            .merge(AIAnalysis::empty("c1"), tags_result("trusted", 1.0, &["a1"]))
            .into_analysis();
        let analysis = merger
            .merge(analysis, tags_result("other", 0.6, &["b1"]))
            .into_analysis();

        // (3 * 1.0 + 1 * 0.6) / 4
        assert!((analysis.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weights_fall_back_to_mean() {
        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 0.0);
        let merger = ResultMerger::new(MergerConfig {
            weighting: ConfidenceWeighting::ByProvider(weights),
            ..MergerConfig::default()
        });

        let analysis = merger
            .merge(AIAnalysis::empty("c1"), tags_result("a", 0.4, &["x1"]))
            .into_analysis();
        assert!((analysis.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_same_timestamp_is_idempotent() {
        let merger = ResultMerger::default();
        let once = merger
            .merge(AIAnalysis::empty("c1"), tags_result("a", 0.7, &["dog"]))
            .into_analysis();

        let outcome = merger.merge(once.clone(), tags_result("a", 0.1, &["cat"]));
        assert!(outcome.is_stale());
        assert_eq!(outcome.into_analysis(), once);
    }

    #[test]
    fn test_older_result_is_rejected() {
        let merger = ResultMerger::default();
        let analysis = merger
            .merge(
                AIAnalysis::empty("c1"),
                tags_result("a", 0.7, &["dog"]).at(t(10)),
            )
            .into_analysis();

        let outcome = merger.merge(analysis.clone(), tags_result("a", 0.9, &["cat"]).at(t(5)));
        assert_eq!(outcome, MergeOutcome::Stale(analysis));
    }

    #[test]
    fn test_newer_result_replaces_contribution() {
        let merger = ResultMerger::default();
        let analysis = merger
            .merge(AIAnalysis::empty("c1"), tags_result("a", 0.5, &["dog"]))
            .into_analysis();
        let analysis = merger
            .merge(analysis, tags_result("a", 0.99, &["cat"]).at(t(0) + Duration::seconds(1)))
            .into_analysis();

        assert_eq!(analysis.contributors, vec!["a"]);
        assert_eq!(analysis.tags, vec!["dog", "cat"]);
        assert!((analysis.confidence - 0.99).abs() < 1e-9);
        assert!(!analysis.requires_manual_verification);
        assert_eq!(analysis.updated_at, t(1));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let merger = ResultMerger::default();
        let analysis = merger
            .merge(AIAnalysis::empty("c1"), tags_result("a", 1.7, &["x1"]))
            .into_analysis();
        assert_eq!(analysis.confidence, 1.0);

        let analysis = merger
            .merge(analysis, tags_result("b", -3.0, &["y1"]))
            .into_analysis();
        assert!((analysis.confidence - 0.5).abs() < 1e-9);

        let analysis = merger
            .merge(analysis, tags_result("c", f64::NAN, &["z1"]))
            .into_analysis();
        assert!((0.0..=1.0).contains(&analysis.confidence));
    }

    #[test]
    fn test_verification_flag_tracks_threshold() {
        let merger = ResultMerger::default();
        for confidence in [0.0, 0.5, 0.979, 0.98, 0.99, 1.0] {
            let analysis = merger
                .merge(AIAnalysis::empty("c1"), tags_result("a", confidence, &["x1"]))
                .into_analysis();
            assert_eq!(
                analysis.requires_manual_verification,
                analysis.confidence < DEFAULT_VERIFICATION_THRESHOLD,
                "confidence {}",
                confidence
            );
        }
    }

    #[test]
    fn test_threshold_override() {
        let merger = ResultMerger::default();
        let analysis = merger
            .merge_with_threshold(AIAnalysis::empty("c1"), tags_result("a", 0.9, &["x1"]), 0.8)
            .into_analysis();
        assert!(!analysis.requires_manual_verification);
    }

    #[test]
    fn test_overlapping_faces_are_deduplicated() {
        let merger = ResultMerger::default();
        let first = ProviderResult::new("a", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_faces(vec![face(0.0, 0.8)])
            .at(t(0));
        let second = ProviderResult::new("b", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_faces(vec![face(10.0, 1.0), face(500.0, 0.7)])
            .at(t(0));

        let analysis = merger.merge(AIAnalysis::empty("c1"), first).into_analysis();
        let analysis = merger.merge(analysis, second).into_analysis();

        assert_eq!(analysis.faces.len(), 2);
        assert!((analysis.faces[0].confidence - 0.9).abs() < 1e-9);
        assert!((analysis.faces[1].confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_conflicting_identities_are_kept_apart() {
        let merger = ResultMerger::default();
        let first = ProviderResult::new("a", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_faces(vec![face(0.0, 0.8).with_person("grandma")])
            .at(t(0));
        let second = ProviderResult::new("b", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_faces(vec![
                face(0.0, 0.8).with_person("aunt"),
                face(5.0, 0.6).with_person("grandma"),
            ])
            .at(t(0));

        let analysis = merger.merge(AIAnalysis::empty("c1"), first).into_analysis();
        let analysis = merger.merge(analysis, second).into_analysis();

        assert_eq!(analysis.faces.len(), 2);
        assert_eq!(analysis.faces[0].person_id.as_deref(), Some("grandma"));
        assert!((analysis.faces[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(analysis.faces[1].person_id.as_deref(), Some("aunt"));
    }

    #[test]
    fn test_unknown_identity_adopts_match() {
        let merger = ResultMerger::default();
        let first = ProviderResult::new("a", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_faces(vec![face(0.0, 0.8)])
            .at(t(0));
        let second = ProviderResult::new("b", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_faces(vec![face(0.0, 0.8).with_person("grandpa")])
            .at(t(0));

        let analysis = merger.merge(AIAnalysis::empty("c1"), first).into_analysis();
        let analysis = merger.merge(analysis, second).into_analysis();

        assert_eq!(analysis.faces.len(), 1);
        assert_eq!(analysis.faces[0].person_id.as_deref(), Some("grandpa"));
    }

    #[test]
    fn test_metadata_is_stored_per_provider() {
        let merger = ResultMerger::default();
        let vision = tags_result("vision", 0.9, &["dog"]).with_metadata(ProviderMetadata::Vision {
            label_count: 1,
            best_guess_labels: vec![],
            web_entities: vec![],
        });
        let index = ProviderResult::new("index", CapabilitySet::of(&[Capability::Faces]), 0.9)
            .with_metadata(ProviderMetadata::FaceIndex {
                collection_id: "family".into(),
                matched_faces: 0,
            })
            .at(t(0));

        let analysis = merger.merge(AIAnalysis::empty("c1"), vision).into_analysis();
        let analysis = merger.merge(analysis, index).into_analysis();

        assert!(matches!(
            analysis.provider_metadata.get("vision"),
            Some(ProviderMetadata::Vision { .. })
        ));
        assert!(matches!(
            analysis.provider_metadata.get("index"),
            Some(ProviderMetadata::FaceIndex { .. })
        ));
    }
}
