//! Dispatch request descriptors and key derivation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Input modality of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Written text (glosses, captions, prompts)
    Text,
    /// Recorded or streamed sign video
    Video,
    /// Spoken audio
    Audio,
    /// Extracted pose / landmark sequences
    Pose,
}

impl Modality {
    /// Stable lowercase name used in route keys and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::Pose => "pose",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "video" => Ok(Modality::Video),
            "audio" => Ok(Modality::Audio),
            "pose" => Ok(Modality::Pose),
            other => Err(format!("Unknown modality: {}", other)),
        }
    }
}

/// Relative priority of a request, used for statistics breakdowns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed request flowing through the dispatcher
///
/// The request type is an open string so feature modules (translation,
/// expression generation, tutoring, ...) can register new kinds without
/// touching this crate. The payload is carried opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Unique request ID
    pub id: Uuid,
    /// Request type, e.g. "translate" or "generate_expression"
    pub request_type: String,
    /// Input modality
    pub modality: Modality,
    /// Priority, used for statistics breakdowns
    pub priority: Priority,
    /// Opaque request payload
    pub payload: Value,
    /// Handler-name override from the upstream enrichment step
    pub handler_override: Option<String>,
    /// Cache-key override from the upstream enrichment step
    pub cache_key_override: Option<String>,
    /// When the request entered the dispatch layer
    pub received_at: DateTime<Utc>,
}

impl DispatchRequest {
    /// Create a new request with a normal priority and empty payload
    pub fn new(request_type: impl Into<String>, modality: Modality) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type: request_type.into(),
            modality,
            priority: Priority::default(),
            payload: Value::Null,
            handler_override: None,
            cache_key_override: None,
            received_at: Utc::now(),
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the handler chosen by route resolution
    pub fn with_handler_override(mut self, handler: impl Into<String>) -> Self {
        self.handler_override = Some(handler.into());
        self
    }

    /// Override the derived cache key
    pub fn with_cache_key_override(mut self, key: impl Into<String>) -> Self {
        self.cache_key_override = Some(key.into());
        self
    }

    /// Route key identifying the (type, modality) pair
    pub fn route_key(&self) -> String {
        route_key(&self.request_type, self.modality)
    }

    /// Cache key for this request.
    ///
    /// Uses the enrichment override when present, otherwise
    /// `"{type}:{modality}:{payload}"` where the payload is serialized with
    /// `serde_json`. Object keys serialize in sorted order (serde_json's map
    /// is BTreeMap-backed), so two payloads that are equal as JSON values
    /// always produce the same key.
    pub fn cache_key(&self) -> String {
        if let Some(key) = &self.cache_key_override {
            return key.clone();
        }
        let payload = serde_json::to_string(&self.payload).unwrap_or_default();
        format!("{}:{}:{}", self.request_type, self.modality, payload)
    }
}

/// Derive the route key for a (request type, modality) pair
pub fn route_key(request_type: &str, modality: Modality) -> String {
    format!("{}:{}", request_type, modality.as_str())
}
