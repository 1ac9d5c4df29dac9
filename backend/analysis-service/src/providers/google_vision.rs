//! Google Cloud Vision API adapter
use crate::model::{
    AnalysisRequest, BoundingBox, Capability, CapabilitySet, DetectedFace, ProviderMetadata,
    ProviderResult,
};
use crate::providers::{AnalysisProvider, CallContext, PermanentKind, ProviderError, TransientKind};
use crate::services::tag_generator::{rank_tags, TagCandidate, TagSource};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Global endpoint; regional endpoints follow the `{region}-vision.googleapis.com` pattern
pub const GLOBAL_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";
const VISION_API_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-vision"];

/// Authentication mode for Vision API
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Use API key authentication
    ApiKey(String),
    /// Use Application Default Credentials (Workload Identity)
    Adc,
}

/// Tag ranking knobs
#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub max_tags: usize,
    pub min_tag_score: f64,
    pub max_faces: i32,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            max_tags: 15,
            min_tag_score: 0.3,
            max_faces: 20,
        }
    }
}

/// Regional endpoint URL for `region` (e.g. `eu`, `us`)
pub fn regional_endpoint(region: &str) -> String {
    format!("https://{}-vision.googleapis.com/v1/images:annotate", region)
}

/// Google Cloud Vision as an analysis provider
pub struct GoogleVisionProvider {
    id: String,
    endpoint: String,
    client: Client,
    auth_mode: AuthMode,
    settings: VisionSettings,
    /// Cached token provider for ADC
    token_provider: Arc<RwLock<Option<Arc<dyn TokenProvider>>>>,
}

// ============================================
// Request types
// ============================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisionRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: Image,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Image {
    source: ImageSource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource {
    /// GCS URL (gs://bucket/path) or HTTPS URL
    image_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
    max_results: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

// ============================================
// Response types
// ============================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct AnnotateImageResponse {
    label_annotations: Option<Vec<EntityAnnotation>>,
    landmark_annotations: Option<Vec<EntityAnnotation>>,
    localized_object_annotations: Option<Vec<LocalizedObjectAnnotation>>,
    face_annotations: Option<Vec<FaceAnnotation>>,
    web_detection: Option<WebDetection>,
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityAnnotation {
    description: String,
    #[serde(default)]
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalizedObjectAnnotation {
    name: String,
    #[serde(default)]
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaceAnnotation {
    bounding_poly: Option<BoundingPoly>,
    fd_bounding_poly: Option<BoundingPoly>,
    #[serde(default)]
    detection_confidence: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct BoundingPoly {
    vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(default)]
struct Vertex {
    x: f64,
    y: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WebDetection {
    web_entities: Option<Vec<WebEntity>>,
    best_guess_labels: Option<Vec<BestGuessLabel>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebEntity {
    description: Option<String>,
    #[serde(default)]
    score: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BestGuessLabel {
    label: String,
}

/// google.rpc.Status
#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Status,
}

impl GoogleVisionProvider {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        auth_mode: AuthMode,
        settings: VisionSettings,
    ) -> Result<Self, reqwest::Error> {
        // Per-call deadlines are enforced by the orchestrator; this only
        // bounds connections that never complete
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            id: id.into(),
            endpoint: endpoint.into(),
            client,
            auth_mode,
            settings,
            token_provider: Arc::new(RwLock::new(None)),
        })
    }

    /// Check if authentication is configured
    pub fn is_configured(&self) -> bool {
        match &self.auth_mode {
            AuthMode::ApiKey(key) => !key.is_empty(),
            AuthMode::Adc => true,
        }
    }

    pub fn auth_mode(&self) -> &AuthMode {
        &self.auth_mode
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let cached = self.token_provider.read().await.clone();
        let provider = match cached {
            Some(provider) => provider,
            None => {
                let mut guard = self.token_provider.write().await;
                match guard.as_ref() {
                    Some(provider) => provider.clone(),
                    None => {
                        let provider = gcp_auth::provider().await.map_err(|e| {
                            ProviderError::permanent(
                                &self.id,
                                PermanentKind::Unauthorized,
                                format!("GCP authentication unavailable: {}", e),
                            )
                        })?;
                        *guard = Some(provider.clone());
                        provider
                    }
                }
            }
        };

        let token = provider.token(VISION_API_SCOPES).await.map_err(|e| {
            ProviderError::transient(
                &self.id,
                TransientKind::Connection,
                format!("failed to obtain access token: {}", e),
            )
        })?;
        Ok(token.as_str().to_string())
    }

    fn build_request(&self, request: &AnalysisRequest) -> VisionRequest {
        let mut features = Vec::new();
        if request.capabilities.contains(Capability::Tags) {
            features.push(Feature {
                feature_type: "LABEL_DETECTION",
                max_results: 20,
            });
            features.push(Feature {
                feature_type: "OBJECT_LOCALIZATION",
                max_results: 10,
            });
        }
        if request.capabilities.contains(Capability::Tags)
            || request.capabilities.contains(Capability::Scenes)
        {
            features.push(Feature {
                feature_type: "WEB_DETECTION",
                max_results: 10,
            });
        }
        if request.capabilities.contains(Capability::Scenes) {
            features.push(Feature {
                feature_type: "LANDMARK_DETECTION",
                max_results: 5,
            });
        }
        if request.capabilities.contains(Capability::Faces) {
            features.push(Feature {
                feature_type: "FACE_DETECTION",
                max_results: self.settings.max_faces,
            });
        }

        VisionRequest {
            requests: vec![AnnotateImageRequest {
                image: Image {
                    source: ImageSource {
                        image_uri: request.content_ref.clone(),
                    },
                },
                features,
                image_context: request.options.language_hint.as_ref().map(|hint| ImageContext {
                    language_hints: vec![hint.clone()],
                }),
            }],
        }
    }

    fn send_error(&self, err: reqwest::Error) -> ProviderError {
        let kind = if err.is_timeout() {
            TransientKind::Timeout
        } else {
            TransientKind::Connection
        };
        ProviderError::transient(&self.id, kind, format!("Vision API request failed: {}", err))
    }

    /// Convert one annotate response into a provider result
    fn to_result(
        &self,
        request: &AnalysisRequest,
        response: AnnotateImageResponse,
    ) -> ProviderResult {
        let web = response.web_detection.unwrap_or_default();
        let best_guess_labels: Vec<String> = web
            .best_guess_labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| l.label)
            .collect();
        let web_entities: Vec<(String, f64)> = web
            .web_entities
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| e.description.map(|d| (d, e.score)))
            .collect();
        let labels = response.label_annotations.unwrap_or_default();
        let label_count = labels.len();

        let mut covered = CapabilitySet::empty();
        let mut scores = Vec::new();

        let tags = if request.capabilities.contains(Capability::Tags) {
            let candidates = labels
                .iter()
                .map(|l| TagCandidate::new(&l.description, l.score, TagSource::Label))
                .chain(
                    response
                        .localized_object_annotations
                        .unwrap_or_default()
                        .into_iter()
                        .map(|o| TagCandidate::new(o.name, o.score, TagSource::Object)),
                )
                .chain(
                    web_entities
                        .iter()
                        .map(|(name, score)| TagCandidate::new(name, *score, TagSource::WebEntity)),
                );
            let ranked = rank_tags(candidates, self.settings.max_tags, self.settings.min_tag_score);
            covered.insert(Capability::Tags);
            scores.extend(ranked.iter().map(|t| t.confidence));
            ranked.into_iter().map(|t| t.tag).collect()
        } else {
            Vec::new()
        };

        let scenes = if request.capabilities.contains(Capability::Scenes) {
            let candidates = response
                .landmark_annotations
                .unwrap_or_default()
                .into_iter()
                .map(|l| TagCandidate::new(l.description, l.score, TagSource::Landmark))
                .chain(
                    best_guess_labels
                        .iter()
                        .map(|label| TagCandidate::new(label, 1.0, TagSource::BestGuess)),
                );
            let ranked = rank_tags(candidates, self.settings.max_tags, self.settings.min_tag_score);
            covered.insert(Capability::Scenes);
            scores.extend(ranked.iter().map(|t| t.confidence));
            ranked.into_iter().map(|t| t.tag).collect()
        } else {
            Vec::new()
        };

        let faces: Vec<DetectedFace> = if request.capabilities.contains(Capability::Faces) {
            covered.insert(Capability::Faces);
            response
                .face_annotations
                .unwrap_or_default()
                .into_iter()
                .filter_map(|face| {
                    let poly = face.fd_bounding_poly.or(face.bounding_poly)?;
                    let bounding_box = bounding_box(&poly.vertices)?;
                    Some(DetectedFace::new(bounding_box, face.detection_confidence.clamp(0.0, 1.0)))
                })
                .collect()
        } else {
            Vec::new()
        };
        scores.extend(faces.iter().map(|f| f.confidence));

        let confidence = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        ProviderResult::new(&self.id, covered, confidence)
            .with_tags(tags)
            .with_scenes(scenes)
            .with_faces(faces)
            .with_metadata(ProviderMetadata::Vision {
                label_count,
                best_guess_labels,
                web_entities: web_entities.into_iter().map(|(name, _)| name).collect(),
            })
    }
}

#[async_trait]
impl AnalysisProvider for GoogleVisionProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::all()
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &CallContext,
    ) -> Result<ProviderResult, ProviderError> {
        info!(
            provider = %self.id,
            content_id = %request.content_id,
            capabilities = %request.capabilities,
            "Analyzing content with Google Vision"
        );

        let body = self.build_request(request);
        let start = std::time::Instant::now();

        let builder = match &self.auth_mode {
            AuthMode::ApiKey(api_key) => self
                .client
                .post(&self.endpoint)
                .query(&[("key", api_key.as_str())]),
            AuthMode::Adc => {
                let token = self.access_token().await?;
                self.client.post(&self.endpoint).bearer_auth(token)
            }
        };

        let send = builder.timeout(ctx.remaining()).json(&body).send();
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ProviderError::timeout(&self.id, start.elapsed()));
            }
            response = send => response.map_err(|e| self.send_error(e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(provider = %self.id, status = %status, error = %error_text, "Vision API request failed");
            let message = serde_json::from_str::<ErrorEnvelope>(&error_text)
                .map(|envelope| envelope.error.message)
                .unwrap_or(error_text);
            return Err(classify_status(&self.id, status, message));
        }

        let vision_response: VisionResponse = response.json().await.map_err(|e| {
            ProviderError::transient(
                &self.id,
                TransientKind::Connection,
                format!("failed to read Vision API response: {}", e),
            )
        })?;

        debug!(
            provider = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Vision API response received"
        );

        let annotate_response = vision_response
            .responses
            .into_iter()
            .next()
            .unwrap_or_default();

        if let Some(status) = annotate_response.error.as_ref() {
            error!(
                provider = %self.id,
                code = status.code,
                message = %status.message,
                "Vision API returned error"
            );
            return Err(classify_rpc_code(&self.id, status.code, status.message.clone()));
        }

        let result = self.to_result(request, annotate_response);
        info!(
            provider = %self.id,
            tags = result.tags.len(),
            scenes = result.scenes.len(),
            faces = result.faces.len(),
            confidence = result.confidence,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image analysis complete"
        );
        Ok(result)
    }
}

/// Axis-aligned box around polygon vertices
fn bounding_box(vertices: &[Vertex]) -> Option<BoundingBox> {
    let first = vertices.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for v in &vertices[1..] {
        min_x = min_x.min(v.x);
        min_y = min_y.min(v.y);
        max_x = max_x.max(v.x);
        max_y = max_y.max(v.y);
    }
    Some(BoundingBox::new(min_x, min_y, max_x - min_x, max_y - min_y))
}

/// Map an HTTP failure status onto the retry taxonomy
fn classify_status(provider: &str, status: StatusCode, message: String) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::transient(provider, TransientKind::RateLimited, message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::transient(provider, TransientKind::Timeout, message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::permanent(provider, PermanentKind::Unauthorized, message)
        }
        StatusCode::NOT_FOUND | StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::PAYLOAD_TOO_LARGE => {
            ProviderError::permanent(provider, PermanentKind::UnsupportedContent, message)
        }
        s if s.is_server_error() => {
            ProviderError::transient(provider, TransientKind::Connection, message)
        }
        _ => ProviderError::permanent(provider, PermanentKind::InvalidInput, message),
    }
}

/// Map a per-image google.rpc.Code onto the retry taxonomy
fn classify_rpc_code(provider: &str, code: i32, message: String) -> ProviderError {
    match code {
        // DEADLINE_EXCEEDED
        4 => ProviderError::transient(provider, TransientKind::Timeout, message),
        // RESOURCE_EXHAUSTED
        8 => ProviderError::transient(provider, TransientKind::RateLimited, message),
        // ABORTED, INTERNAL, UNAVAILABLE
        10 | 13 | 14 => ProviderError::transient(provider, TransientKind::Connection, message),
        // PERMISSION_DENIED, UNAUTHENTICATED
        7 | 16 => ProviderError::permanent(provider, PermanentKind::Unauthorized, message),
        // INVALID_ARGUMENT
        3 => ProviderError::permanent(provider, PermanentKind::InvalidInput, message),
        _ => ProviderError::permanent(provider, PermanentKind::UnsupportedContent, message),
    }
}
