//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`PlatformEvent`]s and is
//! shared via `Arc<EventBus>` across the application.

use chrono::{DateTime, Utc};
use cloudbox_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Function lifecycle event names.
pub mod names {
    pub const FUNCTION_CREATED: &str = "function.created";
    pub const FUNCTION_UPDATED: &str = "function.updated";
    pub const FUNCTION_DELETED: &str = "function.deleted";
    pub const FUNCTION_DEPLOY_STARTED: &str = "function.deploy_started";
    pub const FUNCTION_DEPLOYED: &str = "function.deployed";
    pub const FUNCTION_DEPLOY_FAILED: &str = "function.deploy_failed";
}

// ---------------------------------------------------------------------------
// PlatformEvent
// ---------------------------------------------------------------------------

/// Something that happened to a function.
///
/// Constructed via [`PlatformEvent::new`] and enriched with
/// [`for_function`](PlatformEvent::for_function) and
/// [`with_payload`](PlatformEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    /// Dot-separated event name, e.g. `"function.deployed"`.
    pub event_type: String,

    pub project_id: Option<DbId>,

    pub function_id: Option<DbId>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl PlatformEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            project_id: None,
            function_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Attach the function (and its project) the event is about.
    pub fn for_function(mut self, project_id: DbId, function_id: DbId) -> Self {
        self.project_id = Some(project_id);
        self.function_id = Some(function_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: PlatformEvent) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
