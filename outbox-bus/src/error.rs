//! Error taxonomy for the outbox core and event bus.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox/bus operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Closed hierarchy of errors the core can raise.
///
/// Handler failures are never propagated to the caller of `emit` — they
/// are wrapped as [`OutboxError::HandlerError`] / [`OutboxError::MaxRetriesExceeded`]
/// and delivered to the adapter's error sink instead.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// A second `on`/`addListener` registration for a type already handled.
    #[error("duplicate listener registered for event type '{0}'")]
    DuplicateListener(String),

    /// The adapter does not implement an optional capability.
    #[error("adapter does not support operation: {0}")]
    UnsupportedOperation(&'static str),

    /// `publish` received more events than the backend's batch cap allows.
    #[error("batch of {actual} events exceeds the backend limit of {limit}")]
    BatchSizeLimit { actual: usize, limit: usize },

    /// `waitFor` did not observe a matching event within its deadline.
    #[error("timed out after {0:?} waiting for event")]
    Timeout(std::time::Duration),

    /// The adapter rejected work because it is over capacity.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The polling service's maintenance hook failed.
    #[error("maintenance step failed: {0}")]
    Maintenance(#[source] anyhow::Error),

    /// A handler raised on its final permitted attempt; the record is now
    /// a terminal dead letter.
    #[error("event {event_id} exceeded max retries ({retry_count})")]
    MaxRetriesExceeded {
        event_id: Uuid,
        retry_count: u32,
        #[source]
        source: anyhow::Error,
    },

    /// A handler raised while retries remain; the record was moved back
    /// to `failed` and will be re-claimed once `nextRetryAt` elapses.
    #[error("handler for event {event_id} ({event_type}) failed")]
    HandlerError {
        event_id: Uuid,
        event_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// An uncategorized failure during a polling cycle (query, claim, or
    /// settle I/O).
    #[error("{0}")]
    OperationalError(String),

    /// The underlying store rejected a query or mutation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload/metadata failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboxError {
    /// Wrap an arbitrary uncategorized error as an
    /// [`OutboxError::OperationalError`], used at the boundary between
    /// adapter I/O and the polling loop's error sink.
    pub fn operational(err: impl std::fmt::Display) -> Self {
        OutboxError::OperationalError(err.to_string())
    }
}
