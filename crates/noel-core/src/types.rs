use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face embedding vector as produced by the edge device.
///
/// Serialized as a bare JSON number array so detections decode straight
/// from the `face` topic payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when the vector is non-empty and every component is finite.
    pub fn is_well_formed(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// An enrolled identity from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub avatar_ref: String,
    pub embedding: Embedding,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub registered_at: DateTime<Utc>,
}

/// Best registry match for a single detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub identity_id: String,
    pub display_name: String,
    pub avatar_ref: String,
    /// Similarity of the best match, clamped to [0, 1].
    pub similarity: f32,
}

/// A confirmed check-in. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinEvent {
    pub identity_id: String,
    pub display_name: String,
    pub avatar_ref: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub occurred_at: DateTime<Utc>,
    pub similarity: f32,
}

impl CheckinEvent {
    pub fn from_match(matched: &MatchResult, occurred_at: DateTime<Utc>) -> Self {
        Self {
            identity_id: matched.identity_id.clone(),
            display_name: matched.display_name.clone(),
            avatar_ref: matched.avatar_ref.clone(),
            occurred_at,
            similarity: matched.similarity,
        }
    }
}

/// One face observation inside a `face` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Embedding,
    /// Bounding box `[x1, y1, x2, y2]` in frame pixels.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// One pose estimate. Keypoints are `[x, y, confidence]` triples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub keypoints: Vec<[f32; 3]>,
    #[serde(default)]
    pub confidence: f32,
}

/// A face from the latest batch as shown to observers.
///
/// Carries the detection geometry and, when the detection resolved,
/// who it was. Embedding vectors are never echoed back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveFace {
    pub bbox: Option<[f32; 4]>,
    pub confidence: Option<f32>,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
}

impl ActiveFace {
    pub fn from_detection(detection: &Detection, matched: Option<&MatchResult>) -> Self {
        Self {
            bbox: detection.bbox,
            confidence: detection.confidence,
            identity_id: matched.map(|m| m.identity_id.clone()),
            display_name: matched.map(|m| m.display_name.clone()),
        }
    }
}
