//! Cooperative single-threaded polling loop embedded inside each
//! `Outbox` implementation.

use crate::backoff::calculate_backoff_capped;
use crate::error::{OutboxError, OutboxResult};
use crate::outbox::{ErrorSink, Handler};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

/// The adapter-supplied batch-processing step: claim eligible records and
/// drive each through the handler/settle cycle. Per-event failures are
/// reported through the supplied `ErrorSink` and do not fail the tick
/// itself; only claim/query/settle I/O failures should return `Err`.
pub type ProcessBatchFn = Arc<
    dyn Fn(Handler, ErrorSink) -> Pin<Box<dyn Future<Output = OutboxResult<()>> + Send>>
        + Send
        + Sync,
>;

/// Optional housekeeping step run before every `process_batch` call
/// (e.g. archive cleanup). May raise any error; it is wrapped as
/// [`OutboxError::Maintenance`].
pub type MaintenanceFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub poll_interval_ms: u64,
    pub base_backoff_ms: u64,
    pub max_error_backoff_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            base_backoff_ms: 1000,
            max_error_backoff_ms: 30_000,
        }
    }
}

/// Runs `process_batch` on a timer, applying jittered exponential backoff
/// to the interval whenever a tick fails, and supporting cooperative
/// shutdown via [`PollingService::stop`].
pub struct PollingService {
    config: PollingConfig,
    process_batch: ProcessBatchFn,
    maintenance: Option<MaintenanceFn>,
    is_polling: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingService {
    pub fn new(
        config: PollingConfig,
        process_batch: ProcessBatchFn,
        maintenance: Option<MaintenanceFn>,
    ) -> Self {
        Self {
            config,
            process_batch,
            maintenance,
            is_polling: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Begin polling. Idempotent — calling `start` while already running
    /// is a no-op.
    pub async fn start(&self, handler: Handler, on_error: ErrorSink) {
        if self.is_polling.swap(true, Ordering::SeqCst) {
            return;
        }

        let is_polling = self.is_polling.clone();
        let shutdown = self.shutdown.clone();
        let process_batch = self.process_batch.clone();
        let maintenance = self.maintenance.clone();
        let config = self.config.clone();

        let jh = tokio::spawn(async move {
            let mut error_count: u32 = 0;
            loop {
                if !is_polling.load(Ordering::SeqCst) {
                    break;
                }

                let result = Self::tick(
                    &maintenance,
                    &process_batch,
                    handler.clone(),
                    on_error.clone(),
                )
                .await;

                match result {
                    Ok(()) => {
                        error_count = 0;
                        debug!("polling tick succeeded");
                        Self::sleep_or_shutdown(
                            Duration::from_millis(config.poll_interval_ms),
                            &shutdown,
                        )
                        .await;
                    }
                    Err(err) => {
                        on_error(err, None);
                        error_count += 1;
                        let backoff = calculate_backoff_capped(
                            config.base_backoff_ms,
                            error_count + 1,
                            config.max_error_backoff_ms,
                        );
                        warn!(error_count, ?backoff, "polling tick failed, backing off");
                        Self::sleep_or_shutdown(backoff, &shutdown).await;
                    }
                }

                if !is_polling.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        *self.task.lock().await = Some(jh);
    }

    /// Cease polling and await the in-flight tick. Safe to call
    /// repeatedly, including before `start` has ever run.
    pub async fn stop(&self) {
        self.is_polling.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(jh) = self.task.lock().await.take() {
            let _ = jh.await;
        }
    }

    pub fn is_polling(&self) -> bool {
        self.is_polling.load(Ordering::SeqCst)
    }

    async fn tick(
        maintenance: &Option<MaintenanceFn>,
        process_batch: &ProcessBatchFn,
        handler: Handler,
        on_error: ErrorSink,
    ) -> OutboxResult<()> {
        if let Some(m) = maintenance {
            m().await.map_err(OutboxError::Maintenance)?;
        }
        process_batch(handler, on_error).await
    }

    async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.notified() => {}
        }
    }
}
