//! Inbound sensor payloads.
//!
//! The edge device publishes three JSON documents under a shared
//! namespace: `<ns>/face`, `<ns>/pose` and `<ns>/count`. Extra fields
//! (the device's own `timestamp`, for instance) are ignored.

use crate::types::{Detection, Pose};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid {topic} payload: {source}")]
    Json {
        topic: TopicKind,
        #[source]
        source: serde_json::Error,
    },
}

/// The three subscribed topic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Face,
    Pose,
    Count,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [TopicKind::Face, TopicKind::Pose, TopicKind::Count];

    pub fn suffix(self) -> &'static str {
        match self {
            TopicKind::Face => "face",
            TopicKind::Pose => "pose",
            TopicKind::Count => "count",
        }
    }

    /// Full topic name under `namespace`.
    pub fn topic(self, namespace: &str) -> String {
        format!("{namespace}/{}", self.suffix())
    }

    /// Resolve an incoming topic name. Anything outside the namespace or
    /// with an unknown suffix yields `None`.
    pub fn from_topic(namespace: &str, topic: &str) -> Option<Self> {
        let suffix = topic.strip_prefix(namespace)?.strip_prefix('/')?;
        Self::ALL.into_iter().find(|kind| kind.suffix() == suffix)
    }
}

impl std::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Deserialize)]
struct FacePayload {
    faces: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct PosePayload {
    poses: Vec<Pose>,
}

#[derive(Debug, Deserialize)]
struct CountPayload {
    count: u32,
}

/// A decoded sensor message, one per valid inbound publish.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Face(Vec<Detection>),
    Pose(Vec<Pose>),
    Count(u32),
}

impl InboundEvent {
    pub fn kind(&self) -> TopicKind {
        match self {
            InboundEvent::Face(_) => TopicKind::Face,
            InboundEvent::Pose(_) => TopicKind::Pose,
            InboundEvent::Count(_) => TopicKind::Count,
        }
    }
}

/// Decode a raw payload for the given topic kind.
pub fn decode_payload(kind: TopicKind, payload: &[u8]) -> Result<InboundEvent, DecodeError> {
    let wrap = |source| DecodeError::Json { topic: kind, source };
    Ok(match kind {
        TopicKind::Face => {
            let p: FacePayload = serde_json::from_slice(payload).map_err(wrap)?;
            InboundEvent::Face(p.faces)
        }
        TopicKind::Pose => {
            let p: PosePayload = serde_json::from_slice(payload).map_err(wrap)?;
            InboundEvent::Pose(p.poses)
        }
        TopicKind::Count => {
            let p: CountPayload = serde_json::from_slice(payload).map_err(wrap)?;
            InboundEvent::Count(p.count)
        }
    })
}
