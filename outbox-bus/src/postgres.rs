//! PostgreSQL-backed `Outbox` adapter using `SELECT … FOR UPDATE SKIP
//! LOCKED` for claim exclusivity.
//!
//! Uses the same row-by-row `try_get` decoding, the same `sqlx::query`
//! + `.bind()` style, and the same `anyhow::Context` error wrapping
//! before converting to the crate's own error type as the rest of this
//! crate's adapters, generalized from a publish-only-flag model to the
//! full claim/settle state machine.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE outbox_records (
//!     id                UUID PRIMARY KEY,
//!     event_type        TEXT NOT NULL,
//!     payload           JSONB NOT NULL,
//!     metadata          JSONB,
//!     occurred_at       TIMESTAMPTZ NOT NULL,
//!     status            TEXT NOT NULL,
//!     retry_count       INTEGER NOT NULL DEFAULT 0,
//!     last_error        TEXT,
//!     next_retry_at     TIMESTAMPTZ,
//!     started_on        TIMESTAMPTZ,
//!     keep_alive        TIMESTAMPTZ,
//!     expire_in_seconds BIGINT NOT NULL,
//!     created_on        TIMESTAMPTZ NOT NULL,
//!     completed_on      TIMESTAMPTZ
//! );
//!
//! CREATE INDEX outbox_records_status_next_retry_idx ON outbox_records (status, next_retry_at);
//! CREATE INDEX outbox_records_status_keep_alive_idx ON outbox_records (status, keep_alive);
//! ```

use crate::backoff::calculate_backoff;
use crate::error::{OutboxError, OutboxResult};
use crate::event::{Event, FailedEvent};
use crate::outbox::{ErrorSink, Handler, Outbox, TxHandle};
use crate::polling::{PollingConfig, PollingService, ProcessBatchFn};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PostgresOutboxConfig {
    pub batch_size: i64,
    pub max_retries: i32,
    pub base_backoff_ms: u64,
    pub processing_timeout_secs: i64,
    pub poll_interval_ms: u64,
    pub max_error_backoff_ms: u64,
    pub max_batch_publish: usize,
}

impl Default for PostgresOutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 5,
            base_backoff_ms: 1000,
            processing_timeout_secs: 30,
            poll_interval_ms: 1000,
            max_error_backoff_ms: 30_000,
            max_batch_publish: 100,
        }
    }
}

struct ClaimedRow {
    id: Uuid,
    event_type: String,
    payload: Value,
    metadata: Option<Value>,
    occurred_at: DateTime<Utc>,
    retry_count: i32,
}

/// `Outbox` implementation backed by a PostgreSQL table, claiming via
/// `FOR UPDATE SKIP LOCKED`, the standard way to give relational stores
/// claim exclusivity without an external lock service.
pub struct PostgresOutbox {
    pool: PgPool,
    config: PostgresOutboxConfig,
    polling: PollingService,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool, config: PostgresOutboxConfig) -> Self {
        let process_batch: ProcessBatchFn = {
            let pool = pool.clone();
            let config = config.clone();
            std::sync::Arc::new(move |handler: Handler, on_error: ErrorSink| {
                let pool = pool.clone();
                let config = config.clone();
                Box::pin(Self::process_batch(pool, config, handler, on_error))
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
            pool,
            config,
            polling,
        }
    }

    async fn insert_one(
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
        expire_in_seconds: i64,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_records (
                id, event_type, payload, metadata, occurred_at,
                status, retry_count, expire_in_seconds, created_on
            ) VALUES ($1, $2, $3, $4, $5, 'created', 0, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.metadata.as_ref().map(|m| serde_json::to_value(m)).transpose()?)
        .bind(event.occurred_at)
        .bind(expire_in_seconds)
        .bind(event.occurred_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Claim up to `batch_size` eligible rows atomically: one
    /// transaction, `SELECT … FOR UPDATE SKIP LOCKED LIMIT $1`, then an
    /// `UPDATE` of the selected ids to `active` before commit — so a
    /// second worker's concurrent `SELECT` never observes the same row.
    async fn claim_batch(
        pool: &PgPool,
        config: &PostgresOutboxConfig,
    ) -> OutboxResult<Vec<ClaimedRow>> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, metadata, occurred_at, retry_count
            FROM outbox_records
            WHERE status = 'created'
               OR (status = 'failed' AND retry_count <= $1 AND next_retry_at <= $2)
               OR (status = 'active' AND keep_alive + make_interval(secs => expire_in_seconds) < $2)
            ORDER BY occurred_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(config.max_retries)
        .bind(now)
        .bind(config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            sqlx::query(
                "UPDATE outbox_records SET status = 'active', started_on = $2, keep_alive = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            claimed.push(ClaimedRow {
                id,
                event_type: row.try_get("event_type")?,
                payload: row.try_get("payload")?,
                metadata: row.try_get("metadata")?,
                occurred_at: row.try_get("occurred_at")?,
                retry_count: row.try_get("retry_count")?,
            });
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn process_batch(
        pool: PgPool,
        config: PostgresOutboxConfig,
        handler: Handler,
        on_error: ErrorSink,
    ) -> OutboxResult<()> {
        let claimed = Self::claim_batch(&pool, &config).await?;

        for row in claimed {
            let event = Event {
                id: row.id,
                event_type: row.event_type.clone(),
                payload: row.payload,
                occurred_at: row.occurred_at,
                metadata: row
                    .metadata
                    .map(|m| serde_json::from_value(m))
                    .transpose()?,
            };

            match handler(event.clone()).await {
                Ok(()) => {
                    if let Err(e) = Self::settle_completed(&pool, row.id).await {
                        tracing::error!(event_id = %row.id, error = ?e, "failed to settle completed event");
                    }
                }
                Err(err) => {
                    let is_dead_letter = match Self::settle_failed(
                        &pool,
                        row.id,
                        row.retry_count,
                        &config,
                        &err,
                    )
                    .await
                    {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::error!(event_id = %row.id, error = ?e, "failed to settle failed event");
                            continue;
                        }
                    };

                    if is_dead_letter {
                        on_error(
                            OutboxError::MaxRetriesExceeded {
                                event_id: row.id,
                                retry_count: (row.retry_count + 1) as u32,
                                source: err,
                            },
                            Some(event),
                        );
                    } else {
                        on_error(
                            OutboxError::HandlerError {
                                event_id: row.id,
                                event_type: row.event_type,
                                source: err,
                            },
                            Some(event),
                        );
                    }
                }
            }
        }

        Ok(())
    }

    async fn settle_completed(pool: &PgPool, id: Uuid) -> OutboxResult<()> {
        sqlx::query(
            "UPDATE outbox_records SET status = 'completed', completed_on = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn settle_failed(
        pool: &PgPool,
        id: Uuid,
        prior_retry_count: i32,
        config: &PostgresOutboxConfig,
        err: &anyhow::Error,
    ) -> OutboxResult<bool> {
        let new_retry_count = prior_retry_count + 1;
        let is_dead_letter = new_retry_count > config.max_retries;
        let next_retry_at = if is_dead_letter {
            None
        } else {
            let backoff = calculate_backoff(config.base_backoff_ms, new_retry_count as u32);
            Some(Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default())
        };

        sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'failed', retry_count = $2, last_error = $3, next_retry_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_retry_count)
        .bind(err.to_string())
        .bind(next_retry_at)
        .execute(pool)
        .await?;

        Ok(is_dead_letter)
    }
}

#[async_trait]
impl Outbox for PostgresOutbox {
    async fn publish(&self, events: Vec<Event>, tx: Option<TxHandle<'_>>) -> OutboxResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        if events.len() > self.config.max_batch_publish {
            return Err(OutboxError::BatchSizeLimit {
                actual: events.len(),
                limit: self.config.max_batch_publish,
            });
        }

        if let Some(handle) = tx {
            if let Some(caller_tx) = handle.downcast_mut::<Transaction<'static, Postgres>>() {
                for event in &events {
                    Self::insert_one(caller_tx, event, self.config.processing_timeout_secs)
                        .await?;
                }
                return Ok(());
            }
        }

        let mut own_tx = self.pool.begin().await?;
        for event in &events {
            Self::insert_one(&mut own_tx, event, self.config.processing_timeout_secs).await?;
        }
        own_tx.commit().await?;
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
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, metadata, occurred_at, retry_count, last_error, started_on
            FROM outbox_records
            WHERE status = 'failed' AND retry_count > $1
            ORDER BY occurred_at DESC
            LIMIT 100
            "#,
        )
        .bind(self.config.max_retries)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: Option<Value> = row.try_get("metadata")?;
            out.push(FailedEvent {
                event: Event {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    occurred_at: row.try_get("occurred_at")?,
                    metadata: metadata.map(serde_json::from_value).transpose()?,
                },
                retry_count: row.try_get::<i32, _>("retry_count")? as u32,
                error: row.try_get("last_error")?,
                last_attempt_at: row.try_get("started_on")?,
            });
        }
        Ok(out)
    }

    async fn retry_events(&self, ids: Vec<Uuid>) -> OutboxResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'created', retry_count = 0, last_error = NULL, next_retry_at = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
