//! The adapter contract every backend implements.

use crate::error::{OutboxError, OutboxResult};
use crate::event::{Event, FailedEvent};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// The per-event callback invoked once a record has been claimed.
///
/// Boxed rather than generic so `Outbox` can remain object-safe and be
/// stored behind `Arc<dyn Outbox>` by the bus and the polling service —
/// the same boxed-async-callback shape `async_trait` methods use,
/// generalized here to a free function since there is no per-adapter
/// state to carry.
pub type Handler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Sink for errors the adapter cannot propagate synchronously: handler
/// failures (while retries remain, and on final exhaustion) and
/// operational failures from the polling loop itself.
pub type ErrorSink = Arc<dyn Fn(OutboxError, Option<Event>) + Send + Sync>;

/// An opaque, caller-owned ambient transaction. The bus and the `Outbox`
/// trait never inspect it — it is forwarded as-is. A concrete adapter
/// downcasts it to its own transaction type (e.g. `Transaction<'static,
/// Postgres>`) to participate in it; adapters that don't recognize the
/// concrete type treat a non-matching `tx` as if none were given and
/// open their own short transaction instead. An explicit argument is
/// preferred here over a thread-local ambient transaction.
pub type TxHandle<'a> = &'a mut (dyn std::any::Any + Send);

/// Durable storage contract for the outbox pattern: persist events,
/// coordinate at-most-one-active-claim per record, and drive records
/// through the claim/settle state machine.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Idempotent-on-id append. Empty input is a no-op. May fail with
    /// [`OutboxError::BatchSizeLimit`] if the batch exceeds a
    /// backend-imposed cap.
    async fn publish(&self, events: Vec<Event>, tx: Option<TxHandle<'_>>) -> OutboxResult<()>;

    /// Install the per-event handler and error sink, then begin polling.
    /// Idempotent — a second `start` while already polling is a no-op.
    async fn start(&self, handler: Handler, on_error: ErrorSink) -> OutboxResult<()>;

    /// Cease polling and await in-flight work. Safe to call repeatedly.
    async fn stop(&self) -> OutboxResult<()>;

    /// Most-recent failed records in descending `occurred_at` order.
    /// Adapters without this capability keep the default, which reports
    /// [`OutboxError::UnsupportedOperation`].
    async fn get_failed_events(&self) -> OutboxResult<Vec<FailedEvent>> {
        Err(OutboxError::UnsupportedOperation("get_failed_events"))
    }

    /// Atomically reset each matching record to `created`, clearing
    /// retry state. Adapters without this capability keep the default.
    async fn retry_events(&self, _ids: Vec<Uuid>) -> OutboxResult<()> {
        Err(OutboxError::UnsupportedOperation("retry_events"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal adapter exercising only the mandatory operations, to
    /// confirm the optional-capability defaults surface
    /// `UnsupportedOperation` rather than panicking or silently no-op'ing.
    struct BareAdapter;

    #[async_trait]
    impl Outbox for BareAdapter {
        async fn publish(&self, _events: Vec<Event>, _tx: Option<TxHandle<'_>>) -> OutboxResult<()> {
            Ok(())
        }
        async fn start(&self, _handler: Handler, _on_error: ErrorSink) -> OutboxResult<()> {
            Ok(())
        }
        async fn stop(&self) -> OutboxResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn adapter_without_optional_capabilities_reports_unsupported() {
        let adapter = BareAdapter;
        assert!(matches!(
            adapter.get_failed_events().await,
            Err(OutboxError::UnsupportedOperation("get_failed_events"))
        ));
        assert!(matches!(
            adapter.retry_events(vec![Uuid::new_v4()]).await,
            Err(OutboxError::UnsupportedOperation("retry_events"))
        ));
    }
}
