//! Domain Events
//!
//! Change notifications consumed by the invalidation router. Events are
//! transient: each one is consumed once and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheKey;

/// Why an entry is being invalidated; selects the invalidation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// Source data changed; delete from both tiers now
    DataUpdated,
    /// Rarely read; remove on next access
    LowUsage,
    /// Entry is large; delete only above the size threshold
    SizePressure,
    /// A dependency changed; delete the entry and its dependents
    DependencyChange,
}

impl InvalidationReason {
    pub const ALL: [InvalidationReason; 4] = [
        InvalidationReason::DataUpdated,
        InvalidationReason::LowUsage,
        InvalidationReason::SizePressure,
        InvalidationReason::DependencyChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::DataUpdated => "data_updated",
            InvalidationReason::LowUsage => "low_usage",
            InvalidationReason::SizePressure => "size_pressure",
            InvalidationReason::DependencyChange => "dependency_change",
        }
    }
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional detail attached to an invalidation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMetadata {
    /// Reported payload size, consulted by size-pressure invalidation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Changed dependency tag, consulted by cascading invalidation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    /// Anything else the producer attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InvalidationMetadata {
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Default::default()
        }
    }

    pub fn with_dependency(dependency: impl Into<String>) -> Self {
        Self {
            dependency: Some(dependency.into()),
            ..Default::default()
        }
    }
}

/// Request to clear a single cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub pattern: String,
    pub key: String,
    pub reason: InvalidationReason,
    #[serde(default)]
    pub metadata: InvalidationMetadata,
}

impl InvalidationEvent {
    pub fn new(
        pattern: impl Into<String>,
        key: impl Into<String>,
        reason: InvalidationReason,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            key: key.into(),
            reason,
            metadata: InvalidationMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: InvalidationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.pattern, &self.key)
    }
}

/// Generic change notification pushed by upstream write-path code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    /// Emitting service
    #[serde(default)]
    pub service: String,
    /// Event type, e.g. "user.updated"
    pub event_type: String,
    /// Affected entity, when the event targets one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub metadata: InvalidationMetadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(event_type: impl Into<String>, entity_id: Option<String>) -> Self {
        Self {
            service: String::new(),
            event_type: event_type.into(),
            entity_id,
            metadata: InvalidationMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_metadata(mut self, metadata: InvalidationMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reason_wire_names() {
        for reason in InvalidationReason::ALL {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, json!(reason.as_str()));
        }
        let parsed: InvalidationReason = serde_json::from_str("\"dependency_change\"").unwrap();
        assert_eq!(parsed, InvalidationReason::DependencyChange);
    }

    #[test]
    fn test_invalidation_event_deserialization() {
        let event: InvalidationEvent = serde_json::from_value(json!({
            "pattern": "media",
            "key": "m1",
            "reason": "size_pressure",
            "metadata": { "size": 2048, "uploader": "u9" }
        }))
        .unwrap();

        assert_eq!(event.cache_key(), CacheKey::new("media", "m1"));
        assert_eq!(event.metadata.size, Some(2048));
        assert_eq!(event.metadata.extra["uploader"], json!("u9"));
    }

    #[test]
    fn test_metadata_is_optional() {
        let event: InvalidationEvent = serde_json::from_value(json!({
            "pattern": "user", "key": "u1", "reason": "data_updated"
        }))
        .unwrap();
        assert_eq!(event.metadata, InvalidationMetadata::default());
    }

    #[test]
    fn test_service_event_defaults() {
        let event: ServiceEvent = serde_json::from_value(json!({
            "eventType": "user.updated",
            "entityId": "u1"
        }))
        .unwrap();
        assert_eq!(event.event_type, "user.updated");
        assert_eq!(event.entity_id.as_deref(), Some("u1"));
        assert!(event.service.is_empty());
    }
}
