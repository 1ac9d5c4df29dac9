//! Analysis domain types shared by providers, the merger and the orchestrator
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================
// Capabilities
// ============================================

/// One kind of analysis a provider can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Faces,
    Scenes,
    Tags,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Faces, Capability::Scenes, Capability::Tags];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Faces => "faces",
            Capability::Scenes => "scenes",
            Capability::Tags => "tags",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Capability::Faces => 0b001,
            Capability::Scenes => 0b010,
            Capability::Tags => 0b100,
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "faces" | "face" => Ok(Capability::Faces),
            "scenes" | "scene" => Ok(Capability::Scenes),
            "tags" | "tag" => Ok(Capability::Tags),
            other => Err(format!("unknown capability '{}'", other)),
        }
    }
}

/// Small set of capabilities
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<Capability>", from = "Vec<Capability>")]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn of(capabilities: &[Capability]) -> Self {
        capabilities.iter().copied().collect()
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn contains_all(&self, other: CapabilitySet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: CapabilitySet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn intersection(&self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 & other.0)
    }

    pub fn union(&self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Stable textual form used in cache keys, e.g. `faces+tags`
    pub fn fingerprint(&self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        self.iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(capabilities: Vec<Capability>) -> Self {
        capabilities.into_iter().collect()
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(set: CapabilitySet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

// ============================================
// Request
// ============================================

/// Per-request tuning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Replaces the configured verification threshold for this request
    pub min_confidence: Option<f64>,
    /// BCP-47 language hint forwarded to providers
    pub language_hint: Option<String>,
}

/// One analysis invocation for one content item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Opaque content identifier (cache identity)
    pub content_id: String,
    /// Opaque reference providers use to fetch the bytes (gs:// or https:// URI)
    pub content_ref: String,
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub options: AnalysisOptions,
}

impl AnalysisRequest {
    pub fn new(
        content_id: impl Into<String>,
        content_ref: impl Into<String>,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            content_ref: content_ref.into(),
            capabilities,
            options: AnalysisOptions::default(),
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.options.min_confidence = Some(min_confidence);
        self
    }

    pub fn with_language_hint(mut self, language: impl Into<String>) -> Self {
        self.options.language_hint = Some(language.into());
        self
    }
}

// ============================================
// Provider output
// ============================================

/// Axis-aligned box in the pixel space of the original content item
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    /// Detection confidence in [0, 1]
    pub confidence: f64,
    /// Matched person, when the provider recognised one
    pub person_id: Option<String>,
}

impl DetectedFace {
    pub fn new(bounding_box: BoundingBox, confidence: f64) -> Self {
        Self {
            bounding_box,
            confidence,
            person_id: None,
        }
    }

    pub fn with_person(mut self, person_id: impl Into<String>) -> Self {
        self.person_id = Some(person_id.into());
        self
    }
}

/// Provider-specific extras, one variant per known provider shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderMetadata {
    /// Label/web-detection style providers
    Vision {
        label_count: usize,
        best_guess_labels: Vec<String>,
        web_entities: Vec<String>,
    },
    /// Face recognition providers backed by a person index
    FaceIndex {
        collection_id: String,
        matched_faces: usize,
    },
    /// Anything else
    Opaque {
        data: serde_json::Map<String, serde_json::Value>,
    },
}

impl Default for ProviderMetadata {
    fn default() -> Self {
        ProviderMetadata::Opaque {
            data: serde_json::Map::new(),
        }
    }
}

/// Output of one successful provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider_id: String,
    /// Capabilities this result actually answers for
    pub capabilities: CapabilitySet,
    pub tags: Vec<String>,
    pub scenes: Vec<String>,
    pub faces: Vec<DetectedFace>,
    /// Overall confidence in [0, 1]
    pub confidence: f64,
    pub metadata: ProviderMetadata,
    pub timestamp: DateTime<Utc>,
}

impl ProviderResult {
    pub fn new(provider_id: impl Into<String>, capabilities: CapabilitySet, confidence: f64) -> Self {
        Self {
            provider_id: provider_id.into(),
            capabilities,
            tags: Vec::new(),
            scenes: Vec::new(),
            faces: Vec::new(),
            confidence,
            metadata: ProviderMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scenes<I, S>(mut self, scenes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scenes = scenes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_faces(mut self, faces: Vec<DetectedFace>) -> Self {
        self.faces = faces;
        self
    }

    pub fn with_metadata(mut self, metadata: ProviderMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================
// Merged analysis
// ============================================

/// What one provider contributed to the merged confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Canonical merged analysis for one content item.
///
/// Only `ResultMerger` produces new versions of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIAnalysis {
    pub content_id: String,
    pub tags: Vec<String>,
    pub scenes: Vec<String>,
    pub faces: Vec<DetectedFace>,
    pub confidence: f64,
    pub requires_manual_verification: bool,
    pub provider_metadata: BTreeMap<String, ProviderMetadata>,
    pub contributions: BTreeMap<String, Contribution>,
    /// Providers in the order they first contributed
    pub contributors: Vec<String>,
    /// Union of capabilities answered by contributors
    pub capabilities: CapabilitySet,
    pub updated_at: DateTime<Utc>,
}

impl AIAnalysis {
    /// Starting point for a merge: nothing contributed, flagged for review
    pub fn empty(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            tags: Vec::new(),
            scenes: Vec::new(),
            faces: Vec::new(),
            confidence: 0.0,
            requires_manual_verification: true,
            provider_metadata: BTreeMap::new(),
            contributions: BTreeMap::new(),
            contributors: Vec::new(),
            capabilities: CapabilitySet::empty(),
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn has_contributions(&self) -> bool {
        !self.contributors.is_empty()
    }
}
