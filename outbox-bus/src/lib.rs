//! Transactional-outbox core of a reliable event bus.
//!
//! Atomically persist domain events alongside business data, then
//! deliver them to in-process handlers with at-least-once semantics,
//! exponential backoff, stuck-worker recovery, and a dead-letter queue.
//!
//! The three load-bearing pieces: the [`outbox::Outbox`] adapter
//! contract and its claim/process/settle protocol, the
//! [`polling::PollingService`] cooperative loop, and the
//! [`bus::EventBus`] command-dispatcher façade with onion middleware.
//! [`memory::InMemoryOutbox`] is both the reference adapter and the
//! executable definition of the adapter contract; [`postgres::PostgresOutbox`]
//! is the relational implementation.

pub mod backoff;
pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod metrics;
pub mod middleware;
pub mod outbox;
pub mod polling;
pub mod postgres;
pub mod publisher;
pub mod record;

pub use bus::{BusHandler, EventBus};
pub use config::BusConfig;
pub use error::{OutboxError, OutboxResult};
pub use event::{Event, FailedEvent};
pub use memory::{InMemoryOutbox, InMemoryOutboxConfig};
pub use middleware::{Middleware, MiddlewareContext, Next, NextOutcome};
pub use outbox::{ErrorSink, Handler, Outbox, TxHandle};
pub use postgres::{PostgresOutbox, PostgresOutboxConfig};
pub use publisher::{BatchSender, EventPublisher, PublisherConfig};
pub use record::{OutboxRecord, RecordStatus};
