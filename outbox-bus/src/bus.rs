//! The 1:1 command-bus façade over an [`Outbox`].

use crate::error::{OutboxError, OutboxResult};
use crate::event::{Event, FailedEvent};
use crate::metrics::BusMetrics;
use crate::middleware::{run_pipeline, Middleware, NextOutcome, Terminal};
use crate::outbox::{ErrorSink, Handler, Outbox, TxHandle};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// A user-supplied handler, boxed the same way as [`crate::outbox::Handler`].
pub type BusHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Stored registration: `effective` is what actually runs (the
/// self-deregistering wrapper for `once`); `original` is what the
/// caller passed, kept so `off` can match either. Represented as a
/// pair rather than a tagged enum since both the direct and
/// self-deregistering cases need the same `effective`/`original` shape.
#[derive(Clone)]
struct Registration {
    effective: BusHandler,
    original: BusHandler,
}

/// Bridges [`Outbox`]'s boxed callback convention to the bus's handler
/// map and middleware pipeline, enforcing the 1:1 dispatch rule and
/// strict onion middleware ordering.
pub struct EventBus {
    outbox: Arc<dyn Outbox>,
    handlers: Arc<DashMap<String, Registration>>,
    emit_middleware: Arc<RwLock<Vec<Middleware>>>,
    handler_middleware: Arc<RwLock<Vec<Middleware>>>,
    middleware_concurrency: usize,
    metrics: Option<Arc<BusMetrics>>,
}

impl EventBus {
    pub fn new(outbox: Arc<dyn Outbox>, middleware_concurrency: usize) -> Self {
        Self {
            outbox,
            handlers: Arc::new(DashMap::new()),
            emit_middleware: Arc::new(RwLock::new(Vec::new())),
            handler_middleware: Arc::new(RwLock::new(Vec::new())),
            middleware_concurrency: middleware_concurrency.max(1),
            metrics: None,
        }
    }

    /// Attach Prometheus metrics under `service`'s label, registering
    /// them into the process-wide default registry.
    pub fn with_metrics(mut self, service: &str) -> Self {
        self.metrics = Some(Arc::new(BusMetrics::new(service)));
        self
    }

    pub async fn add_emit_middleware(&self, mw: Middleware) {
        self.emit_middleware.write().await.push(mw);
    }

    pub async fn add_handler_middleware(&self, mw: Middleware) {
        self.handler_middleware.write().await.push(mw);
    }

    /// Register the single handler for `event_type`. Fails with
    /// [`OutboxError::DuplicateListener`] if one is already registered.
    pub fn on(&self, event_type: impl Into<String>, handler: BusHandler) -> OutboxResult<()> {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            return Err(OutboxError::DuplicateListener(event_type));
        }
        self.handlers.insert(
            event_type,
            Registration {
                effective: handler.clone(),
                original: handler,
            },
        );
        Ok(())
    }

    pub fn add_listener(&self, event_type: impl Into<String>, handler: BusHandler) -> OutboxResult<()> {
        self.on(event_type, handler)
    }

    /// Register `handler` for `event_type`, wrapped so it deregisters
    /// itself before the first (and only) invocation runs.
    pub fn once(&self, event_type: impl Into<String>, handler: BusHandler) -> OutboxResult<()> {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            return Err(OutboxError::DuplicateListener(event_type));
        }

        let handlers = self.handlers.clone();
        let type_for_wrapper = event_type.clone();
        let original = handler.clone();
        let effective: BusHandler = Arc::new(move |event: Event| {
            let handlers = handlers.clone();
            let type_for_wrapper = type_for_wrapper.clone();
            let handler = handler.clone();
            Box::pin(async move {
                handlers.remove(&type_for_wrapper);
                handler(event).await
            })
        });

        self.handlers
            .insert(event_type, Registration { effective, original });
        Ok(())
    }

    /// Remove the registration for `event_type` if it matches `handler`
    /// — either the handler originally passed to `on`/`once`, or (for a
    /// `once` registration) its wrapper.
    pub fn off(&self, event_type: &str, handler: &BusHandler) {
        if let Some(entry) = self.handlers.get(event_type) {
            let matches = Arc::ptr_eq(&entry.original, handler) || Arc::ptr_eq(&entry.effective, handler);
            if !matches {
                return;
            }
        } else {
            return;
        }
        self.handlers.remove(event_type);
    }

    /// Remove the registration for `event_type`, or every registration
    /// if `event_type` is `None`.
    pub fn remove_all_listeners(&self, event_type: Option<&str>) {
        match event_type {
            Some(t) => {
                self.handlers.remove(t);
            }
            None => self.handlers.clear(),
        }
    }

    /// Register the same handler under each of `types` (still 1:1 per
    /// type — a collision on any one type fails and leaves earlier
    /// registrations from this call in place).
    pub fn subscribe(&self, types: &[&str], handler: BusHandler) -> OutboxResult<()> {
        for t in types {
            self.on(*t, handler.clone())?;
        }
        Ok(())
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        usize::from(self.handlers.contains_key(event_type))
    }

    pub fn event_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_subscription_count(&self) -> usize {
        self.handlers.len()
    }

    /// Fill in identity, run the snapshotted emit pipeline, and publish
    /// whatever the pipeline did not drop.
    pub async fn emit(&self, event: Event, tx: Option<TxHandle<'_>>) -> OutboxResult<()> {
        let snapshot = self.emit_middleware.read().await.clone();
        if snapshot.is_empty() {
            return self.outbox.publish(vec![event], tx).await;
        }

        let has_transaction = tx.is_some();
        let terminal: Terminal = Arc::new(|_e| Box::pin(async { Ok(()) }));
        let outcome = run_pipeline(snapshot, event, has_transaction, terminal)
            .await
            .map_err(OutboxError::operational)?;

        match outcome {
            NextOutcome::Dropped => Ok(()),
            NextOutcome::Continued(event) => {
                let result = self.outbox.publish(vec![event], tx).await;
                if result.is_ok() {
                    if let Some(m) = &self.metrics {
                        m.events_published.inc();
                    }
                }
                result
            }
        }
    }

    /// Run every event through its own snapshotted emit pipeline with
    /// bounded concurrency (`middlewareConcurrency`), then publish the
    /// survivors as a single batch, preserving input order.
    pub async fn emit_many(&self, events: Vec<Event>, tx: Option<TxHandle<'_>>) -> OutboxResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let snapshot = self.emit_middleware.read().await.clone();
        if snapshot.is_empty() {
            return self.outbox.publish(events, tx).await;
        }

        let concurrency = self.middleware_concurrency;
        let has_transaction = tx.is_some();
        let indexed = events.into_iter().enumerate().collect::<Vec<_>>();

        let results = stream::iter(indexed.into_iter().map(|(idx, event)| {
            let snapshot = snapshot.clone();
            async move {
                let terminal: Terminal = Arc::new(|_e| Box::pin(async { Ok(()) }));
                let outcome = run_pipeline(snapshot, event, has_transaction, terminal).await;
                (idx, outcome)
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut ordered: Vec<(usize, NextOutcome)> = Vec::with_capacity(results.len());
        for (idx, outcome) in results {
            ordered.push((idx, outcome.map_err(OutboxError::operational)?));
        }
        ordered.sort_by_key(|(idx, _)| *idx);

        let survivors: Vec<Event> = ordered
            .into_iter()
            .filter_map(|(_, outcome)| match outcome {
                NextOutcome::Continued(e) => Some(e),
                NextOutcome::Dropped => None,
            })
            .collect();

        if survivors.is_empty() {
            return Ok(());
        }
        let published = survivors.len() as u64;
        let result = self.outbox.publish(survivors, tx).await;
        if result.is_ok() {
            if let Some(m) = &self.metrics {
                m.events_published.inc_by(published);
            }
        }
        result
    }

    /// The per-event callback installed into the adapter: runs the
    /// handler-middleware pipeline, then dispatches to the registered
    /// handler for the (possibly middleware-modified) event type.
    /// Absence of a registered handler is not an error.
    fn build_process_event(&self) -> Handler {
        let handlers = self.handlers.clone();
        let handler_middleware = self.handler_middleware.clone();
        let metrics = self.metrics.clone();

        Arc::new(move |event: Event| {
            let handlers = handlers.clone();
            let handler_middleware = handler_middleware.clone();
            let metrics = metrics.clone();
            Box::pin(async move {
                let snapshot = handler_middleware.read().await.clone();
                let terminal: Terminal = Arc::new(move |event: Event| {
                    let handlers = handlers.clone();
                    let metrics = metrics.clone();
                    Box::pin(async move {
                        let effective = handlers.get(&event.event_type).map(|r| r.effective.clone());
                        let Some(effective) = effective else {
                            return Ok(());
                        };
                        let started = std::time::Instant::now();
                        let result = effective(event).await;
                        if let Some(m) = &metrics {
                            m.handler_duration_seconds.observe(started.elapsed().as_secs_f64());
                            if result.is_ok() {
                                m.events_delivered.inc();
                            }
                        }
                        result
                    })
                });

                let outcome = run_pipeline(snapshot, event, false, terminal).await?;
                match outcome {
                    NextOutcome::Continued(_) | NextOutcome::Dropped => Ok(()),
                }
            })
        })
    }

    pub async fn start(&self) -> OutboxResult<()> {
        let process_event = self.build_process_event();
        let metrics = self.metrics.clone();
        let on_error: ErrorSink = Arc::new(move |err, event| {
            warn!(?err, event_id = ?event.as_ref().map(|e| e.id), "outbox error");
            if let Some(m) = &metrics {
                match &err {
                    OutboxError::MaxRetriesExceeded { .. } => m.events_dead_lettered.inc(),
                    OutboxError::HandlerError { .. } => {}
                    _ => m.polling_errors.inc(),
                }
            }
        });
        self.outbox.start(process_event, on_error).await
    }

    pub async fn stop(&self) -> OutboxResult<()> {
        self.outbox.stop().await
    }

    pub async fn get_failed_events(&self) -> OutboxResult<Vec<FailedEvent>> {
        self.outbox.get_failed_events().await
    }

    pub async fn retry_events(&self, ids: Vec<Uuid>) -> OutboxResult<()> {
        self.outbox.retry_events(ids).await
    }

    /// Resolve with the next event of `event_type`, or fail with
    /// [`OutboxError::Timeout`] after `timeout`. Requires no handler
    /// already registered for `event_type` (the wait occupies the same
    /// 1:1 slot a permanent handler would); cleans up on both paths.
    pub async fn wait_for(&self, event_type: impl Into<String>, timeout: Duration) -> OutboxResult<Event> {
        let event_type = event_type.into();
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));

        let handler: BusHandler = Arc::new(move |event: Event| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(event);
            }
            Box::pin(async { Ok(()) })
        });

        self.once(event_type.clone(), handler)?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.remove_all_listeners(Some(&event_type));

        match result {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) | Err(_) => Err(OutboxError::Timeout(timeout)),
        }
    }
}
