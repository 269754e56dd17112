use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    Map(HashMap<String, serde_json::Value>),
}

/// Build progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Event key (e.g., "stage.started", "layer.created")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BuildEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event from `(field, value)` pairs
    pub fn with_fields<I, K>(key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let map = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::new(key, EventPayload::Map(map))
    }

    /// Look up a payload field
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Map(map) => map.get(name),
            EventPayload::Empty => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BuildEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: BuildEvent) {
        tracing::trace!(key = %event.key, "build event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Build events
    pub const BUILD_STARTED: &str = "build.started";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";

    // Stage events
    pub const STAGE_STARTED: &str = "stage.started";
    pub const STAGE_COMPLETED: &str = "stage.completed";
    pub const STAGE_FAILED: &str = "stage.failed";
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
    pub const STAGE_SKIPPED: &str = "stage.skipped";

    // Artifact events
    pub const LAYER_CREATED: &str = "layer.created";
    pub const IMAGE_PRUNED: &str = "image.pruned";
}
