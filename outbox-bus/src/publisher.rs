//! Subscriber-side buffering and retrying helper used by downstream
//! transports. Not part of the persistence core — it sits on top of
//! [`crate::bus::EventBus`] like any other subscriber.
//!
//! Retry is delegated to [`resilience::retry::with_retry`], the shared
//! exponential-backoff-with-jitter helper used for outbound calls,
//! rather than reimplementing backoff here.

use crate::bus::{BusHandler, EventBus};
use crate::error::OutboxResult;
use crate::event::Event;
use resilience::retry::{with_retry, RetryConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error};

/// The user-supplied sink a batch of events is handed to (e.g. an SQS
/// `SendMessageBatch` or a Kafka producer flush).
pub type BatchSender =
    Arc<dyn Fn(Vec<Event>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Capacity of the internal channel feeding the batcher.
    pub buffer_size: usize,
    /// Flush whatever has accumulated after this much inactivity.
    pub buffer_timeout: Duration,
    /// Max number of batch-sends in flight concurrently.
    pub concurrency: usize,
    /// Backend-specific cap on events per batch (e.g. 10 for
    /// EventBridge/SQS, 100 for Kafka/RabbitMQ).
    pub max_batch_size: usize,
    pub retry: RetryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            buffer_timeout: Duration::from_millis(100),
            concurrency: 4,
            max_batch_size: 100,
            retry: RetryConfig::default(),
        }
    }
}

/// Owns the background batching task; dropping or calling [`Self::stop`]
/// flushes whatever is buffered before the task exits.
pub struct EventPublisher {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl EventPublisher {
    /// Subscribe `sender` to every type in `types` on `bus`, buffering
    /// and retry-wrapping deliveries per `config`.
    pub fn start(
        bus: &EventBus,
        types: &[&str],
        config: PublisherConfig,
        sender: BatchSender,
    ) -> OutboxResult<Self> {
        let (tx, rx) = mpsc::channel::<Event>(config.buffer_size.max(1));

        let handler: BusHandler = Arc::new(move |event: Event| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(event)
                    .await
                    .map_err(|_| anyhow::anyhow!("publisher buffer is closed"))
            })
        });
        bus.subscribe(types, handler)?;

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(Self::run(rx, config, sender, shutdown.clone()));

        Ok(Self { shutdown, task })
    }

    /// Stop accepting new events, flush whatever is buffered, and await
    /// in-flight batch sends.
    pub async fn stop(self) {
        self.shutdown.notify_waiters();
        let _ = self.task.await;
    }

    async fn run(
        mut rx: mpsc::Receiver<Event>,
        config: PublisherConfig,
        sender: BatchSender,
        shutdown: Arc<Notify>,
    ) {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut buffer: Vec<Event> = Vec::with_capacity(config.max_batch_size);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    if !buffer.is_empty() {
                        Self::spawn_flush(&mut buffer, &permits, &config, &sender, &mut in_flight);
                    }
                    break;
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            buffer.push(event);
                            if buffer.len() >= config.max_batch_size {
                                Self::spawn_flush(&mut buffer, &permits, &config, &sender, &mut in_flight);
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                Self::spawn_flush(&mut buffer, &permits, &config, &sender, &mut in_flight);
                            }
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(config.buffer_timeout), if !buffer.is_empty() => {
                    Self::spawn_flush(&mut buffer, &permits, &config, &sender, &mut in_flight);
                }
            }

            in_flight.retain(|h| !h.is_finished());
        }

        for h in in_flight {
            let _ = h.await;
        }
    }

    fn spawn_flush(
        buffer: &mut Vec<Event>,
        permits: &Arc<Semaphore>,
        config: &PublisherConfig,
        sender: &BatchSender,
        in_flight: &mut Vec<JoinHandle<()>>,
    ) {
        let batch = std::mem::replace(buffer, Vec::with_capacity(config.max_batch_size));
        if batch.is_empty() {
            return;
        }

        let permits = permits.clone();
        let retry_config = config.retry.clone();
        let sender = sender.clone();
        let n = batch.len();

        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.expect("semaphore never closed");
            let result = with_retry(retry_config, || {
                let sender = sender.clone();
                let batch = batch.clone();
                async move { sender(batch).await }
            })
            .await;

            match result {
                Ok(()) => debug!(batch_size = n, "published buffered batch"),
                Err(err) => error!(batch_size = n, error = %err, "batch send exhausted retries"),
            }
        });

        in_flight.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryOutbox, InMemoryOutboxConfig};
    use crate::outbox::Outbox;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> EventBus {
        let outbox: Arc<dyn Outbox> = Arc::new(InMemoryOutbox::new(InMemoryOutboxConfig::default()));
        EventBus::new(outbox, 10)
    }

    #[tokio::test]
    async fn flushes_on_max_batch_size() {
        let bus = bus();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        let sender: BatchSender = Arc::new(move |batch| {
            let received = received2.clone();
            Box::pin(async move {
                received.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            })
        });

        let publisher = EventPublisher::start(
            &bus,
            &["shipped"],
            PublisherConfig {
                max_batch_size: 3,
                buffer_timeout: Duration::from_secs(10),
                ..Default::default()
            },
            sender,
        )
        .unwrap();

        for i in 0..3 {
            bus.emit(Event::new("shipped", json!({"i": i})), None)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.stop().await;

        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn flushes_on_timeout_with_partial_batch() {
        let bus = bus();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = received.clone();
        let sender: BatchSender = Arc::new(move |batch| {
            let received = received2.clone();
            Box::pin(async move {
                received.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            })
        });

        let publisher = EventPublisher::start(
            &bus,
            &["shipped"],
            PublisherConfig {
                max_batch_size: 100,
                buffer_timeout: Duration::from_millis(30),
                ..Default::default()
            },
            sender,
        )
        .unwrap();

        bus.emit(Event::new("shipped", json!({"i": 0})), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        publisher.stop().await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
