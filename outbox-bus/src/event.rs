//! Event and failed-event value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A domain event as seen by the bus and the outbox adapter.
///
/// `id` and `occurred_at` are filled in by [`crate::bus::EventBus::emit`]
/// when absent; callers constructing an `Event` directly for a seeded
/// test should set both explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable unique identifier, used for idempotency and manual retry.
    pub id: Uuid,

    /// Routing key; exactly one handler may be registered per type.
    pub event_type: String,

    /// Opaque, serializable application payload.
    pub payload: Value,

    /// Logical event timestamp.
    pub occurred_at: DateTime<Utc>,

    /// Mutable bag middleware may read or rewrite.
    pub metadata: Option<HashMap<String, Value>>,
}

impl Event {
    /// Construct a new event, filling `id`/`occurred_at` with fresh
    /// defaults — the same defaulting `EventBus::emit` performs, exposed
    /// here so adapters and tests can build one without going through
    /// the bus.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An event that has failed at least once, as returned by
/// `Outbox::get_failed_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event: Event,

    /// Monotonically increasing count of prior failed attempts.
    pub retry_count: u32,

    /// Human-readable message from the most recent failure.
    pub error: Option<String>,

    /// When the most recent attempt was made.
    pub last_attempt_at: Option<DateTime<Utc>>,
}
