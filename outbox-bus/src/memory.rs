//! In-process reference adapter: the executable definition of the
//! claim/settle contract, used by this crate's own test suite and as a
//! template for new backends.

use crate::backoff::calculate_backoff;
use crate::error::{OutboxError, OutboxResult};
use crate::event::{Event, FailedEvent};
use crate::outbox::{ErrorSink, Handler, Outbox, TxHandle};
use crate::polling::{PollingConfig, PollingService, ProcessBatchFn};
use crate::record::OutboxRecord;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InMemoryOutboxConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub processing_timeout_secs: i64,
    pub poll_interval_ms: u64,
    pub max_error_backoff_ms: u64,
    pub max_batch_publish: usize,
}

impl Default for InMemoryOutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 5,
            base_backoff_ms: 10,
            processing_timeout_secs: 30,
            poll_interval_ms: 10,
            max_error_backoff_ms: 1000,
            max_batch_publish: 1000,
        }
    }
}

struct State {
    records: DashMap<Uuid, OutboxRecord>,
    /// Ids pending claim, in publish/requeue order. Ids currently `active`
    /// or terminal (`completed`, dead-lettered) are absent.
    order: Mutex<VecDeque<Uuid>>,
}

/// In-process queue-backed `Outbox`. Not durable across process restarts
/// — exists to make §4.1's contract directly testable and to serve as
/// the reference a new backend adapter is checked against.
pub struct InMemoryOutbox {
    state: Arc<State>,
    config: InMemoryOutboxConfig,
    polling: PollingService,
}

impl InMemoryOutbox {
    pub fn new(config: InMemoryOutboxConfig) -> Self {
        let state = Arc::new(State {
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        });

        let process_batch: ProcessBatchFn = {
            let state = state.clone();
            let config = config.clone();
            Arc::new(move |handler: Handler, on_error: ErrorSink| {
                let state = state.clone();
                let config = config.clone();
                Box::pin(Self::process_batch(state, config, handler, on_error))
            })
        };

        let polling = PollingService::new(
            PollingConfig {
                poll_interval_ms: config.poll_interval_ms,
                base_backoff_ms: config.base_backoff_ms,
                max_error_backoff_ms: config.max_error_backoff_ms,
            },
            process_batch,
            None,
        );

        Self {
            state,
            config,
            polling,
        }
    }

    /// Number of records that currently exist in the working set
    /// (pending, active, failed, or completed — not yet archived).
    pub fn record_count(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_polling(&self) -> bool {
        self.polling.is_polling()
    }

    async fn process_batch(
        state: Arc<State>,
        config: InMemoryOutboxConfig,
        handler: Handler,
        on_error: ErrorSink,
    ) -> OutboxResult<()> {
        let claimed = Self::claim_batch(&state, &config).await;
        if claimed.is_empty() {
            return Ok(());
        }
        debug!(count = claimed.len(), "claimed batch from in-memory outbox");

        for (id, event) in claimed {
            let event_for_sink = event.clone();
            match handler(event).await {
                Ok(()) => {
                    if let Some(mut rec) = state.records.get_mut(&id) {
                        rec.complete(Utc::now());
                    }
                    debug!(event_id = %id, "event handled successfully");
                }
                Err(err) => {
                    Self::settle_failure(&state, &config, id, event_for_sink, err, &on_error)
                        .await;
                }
            }
        }

        Ok(())
    }

    async fn claim_batch(state: &Arc<State>, config: &InMemoryOutboxConfig) -> Vec<(Uuid, Event)> {
        let now = Utc::now();
        let mut order = state.order.lock().await;
        let mut claimed = Vec::new();
        let mut remaining = VecDeque::with_capacity(order.len());

        while let Some(id) = order.pop_front() {
            if claimed.len() >= config.batch_size {
                remaining.push_back(id);
                continue;
            }
            let eligible = state
                .records
                .get(&id)
                .map(|r| r.is_claimable(config.max_retries, now))
                .unwrap_or(false);

            if eligible {
                if let Some(mut rec) = state.records.get_mut(&id) {
                    rec.claim(now);
                    claimed.push((id, rec.event.clone()));
                }
            } else {
                remaining.push_back(id);
            }
        }

        *order = remaining;
        claimed
    }

    async fn settle_failure(
        state: &Arc<State>,
        config: &InMemoryOutboxConfig,
        id: Uuid,
        event: Event,
        err: anyhow::Error,
        on_error: &ErrorSink,
    ) {
        let now = Utc::now();
        let retry_count;
        let is_dead_letter;
        {
            let mut rec = match state.records.get_mut(&id) {
                Some(r) => r,
                None => return,
            };
            let backoff = calculate_backoff(config.base_backoff_ms, rec.retry_count + 1);
            is_dead_letter = rec.fail(
                err.to_string(),
                config.max_retries,
                chrono::Duration::from_std(backoff).unwrap_or_default(),
                now,
            );
            retry_count = rec.retry_count;
        }

        let event_type = event.event_type.clone();
        if is_dead_letter {
            warn!(event_id = %id, event_type, retry_count, "event exhausted retries, moved to dead letter");
            on_error(
                OutboxError::MaxRetriesExceeded {
                    event_id: id,
                    retry_count,
                    source: err,
                },
                Some(event),
            );
        } else {
            // Re-queue at the front so the next tick retries it.
            state.order.lock().await.push_front(id);
            warn!(event_id = %id, event_type, retry_count, "event handler failed, re-queued for retry");
            on_error(
                OutboxError::HandlerError {
                    event_id: id,
                    event_type,
                    source: err,
                },
                Some(event),
            );
        }
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn publish(&self, events: Vec<Event>, _tx: Option<TxHandle<'_>>) -> OutboxResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        if events.len() > self.config.max_batch_publish {
            return Err(OutboxError::BatchSizeLimit {
                actual: events.len(),
                limit: self.config.max_batch_publish,
            });
        }

        let mut order = self.state.order.lock().await;
        for event in events {
            let id = event.id;
            let record = OutboxRecord::new(event, self.config.processing_timeout_secs);
            self.state.records.insert(id, record);
            order.push_back(id);
        }
        Ok(())
    }

    async fn start(&self, handler: Handler, on_error: ErrorSink) -> OutboxResult<()> {
        self.polling.start(handler, on_error).await;
        Ok(())
    }

    async fn stop(&self) -> OutboxResult<()> {
        self.polling.stop().await;
        Ok(())
    }

    async fn get_failed_events(&self) -> OutboxResult<Vec<FailedEvent>> {
        let mut failed: Vec<FailedEvent> = self
            .state
            .records
            .iter()
            .filter(|entry| entry.is_dead_letter(self.config.max_retries))
            .map(|entry| FailedEvent {
                event: entry.event.clone(),
                retry_count: entry.retry_count,
                error: entry.last_error.clone(),
                last_attempt_at: entry.started_on,
            })
            .collect();

        failed.sort_by(|a, b| b.event.occurred_at.cmp(&a.event.occurred_at));
        failed.truncate(100);
        Ok(failed)
    }

    async fn retry_events(&self, ids: Vec<Uuid>) -> OutboxResult<()> {
        let mut order = self.state.order.lock().await;
        for id in ids {
            if let Some(mut rec) = self.state.records.get_mut(&id) {
                rec.manual_retry();
                order.push_front(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn publish_is_noop_on_empty_input() {
        let outbox = InMemoryOutbox::new(InMemoryOutboxConfig::default());
        outbox.publish(vec![], None).await.unwrap();
        assert_eq!(outbox.record_count(), 0);
    }

    #[tokio::test]
    async fn publish_rejects_oversized_batch() {
        let outbox = InMemoryOutbox::new(InMemoryOutboxConfig {
            max_batch_publish: 2,
            ..Default::default()
        });
        let events: Vec<Event> = (0..3).map(|_| Event::new("t", json!({}))).collect();
        let err = outbox.publish(events, None).await.unwrap_err();
        assert!(matches!(err, OutboxError::BatchSizeLimit { actual: 3, limit: 2 }));
    }

    #[tokio::test]
    async fn happy_path_delivers_and_completes() {
        let outbox = InMemoryOutbox::new(InMemoryOutboxConfig::default());
        let event = Event::new("user.created", json!({"email": "a@b"}));
        let id = event.id;
        outbox.publish(vec![event], None).await.unwrap();

        let seen = Arc::new(Notify::new());
        let seen2 = seen.clone();
        let handler: Handler = Arc::new(move |_e| {
            let seen = seen2.clone();
            Box::pin(async move {
                seen.notify_one();
                Ok(())
            })
        });
        let on_error: ErrorSink = Arc::new(|_e, _ev| {});
        outbox.start(handler, on_error).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), seen.notified())
            .await
            .expect("handler should run");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        outbox.stop().await.unwrap();

        let rec = outbox.state.records.get(&id).unwrap();
        assert_eq!(rec.status, crate::record::RecordStatus::Completed);
    }

    #[tokio::test]
    async fn retry_then_success_calls_handler_three_times() {
        let outbox = InMemoryOutbox::new(InMemoryOutboxConfig {
            max_retries: 5,
            base_backoff_ms: 5,
            poll_interval_ms: 5,
            ..Default::default()
        });
        outbox
            .publish(vec![Event::new("t", json!({}))], None)
            .await
            .unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let handler: Handler = Arc::new(move |_e| {
            let attempts = attempts2.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            })
        });
        let on_error: ErrorSink = Arc::new(|_e, _ev| {});
        outbox.start(handler, on_error).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        outbox.stop().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_moves_to_dead_letter() {
        let outbox = InMemoryOutbox::new(InMemoryOutboxConfig {
            max_retries: 2,
            base_backoff_ms: 5,
            poll_interval_ms: 5,
            ..Default::default()
        });
        outbox
            .publish(vec![Event::new("t", json!({}))], None)
            .await
            .unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let handler: Handler = Arc::new(move |_e| {
            let attempts = attempts2.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("permanent failure")
            })
        });

        let final_errors = Arc::new(AtomicU32::new(0));
        let final_errors2 = final_errors.clone();
        let on_error: ErrorSink = Arc::new(move |err, _ev| {
            if matches!(err, OutboxError::MaxRetriesExceeded { .. }) {
                final_errors2.fetch_add(1, Ordering::SeqCst);
            }
        });
        outbox.start(handler, on_error).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        outbox.stop().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 retries
        assert_eq!(final_errors.load(Ordering::SeqCst), 1);

        let failed = outbox.get_failed_events().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].retry_count >= 2);
    }

    #[tokio::test]
    async fn retry_events_restores_dead_letter_for_redelivery() {
        let outbox = InMemoryOutbox::new(InMemoryOutboxConfig {
            max_retries: 1,
            base_backoff_ms: 5,
            poll_interval_ms: 5,
            ..Default::default()
        });
        let event = Event::new("t", json!({}));
        let id = event.id;
        outbox.publish(vec![event], None).await.unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let handler: Handler = Arc::new(move |_e| {
            let attempts = attempts2.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    anyhow::bail!("fail until retried manually")
                }
                Ok(())
            })
        });
        let on_error: ErrorSink = Arc::new(|_e, _ev| {});
        outbox.start(handler, on_error).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(outbox
            .get_failed_events()
            .await
            .unwrap()
            .iter()
            .any(|f| f.event.id == id));

        outbox.retry_events(vec![id]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        outbox.stop().await.unwrap();

        let rec = outbox.state.records.get(&id).unwrap();
        assert_eq!(rec.status, crate::record::RecordStatus::Completed);
    }
}
