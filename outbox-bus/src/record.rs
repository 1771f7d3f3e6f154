//! The stored outbox record and its state machine.

use crate::event::Event;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored outbox record.
///
/// Transitions:
/// `created --claim--> active --success--> completed`
/// `active --fail--> failed --(re-claim if eligible)--> active`
/// `failed --manual retry--> created`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Created,
    Active,
    Failed,
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Created => "created",
            RecordStatus::Active => "active",
            RecordStatus::Failed => "failed",
            RecordStatus::Completed => "completed",
        }
    }
}

/// The durable record backing a single `Event`, independent of which
/// adapter stores it.
///
/// Invariants:
/// - `status == Created` implies `retry_count == 0 && last_error.is_none()`.
/// - `status == Active` implies `started_on` and `keep_alive` are set.
/// - `status == Failed` implies `retry_count > 0` and `next_retry_at` is set.
/// - a record with `retry_count > max_retries` is never re-claimed
///   automatically (only a manual retry resets it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event: Event,
    pub status: RecordStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_on: Option<DateTime<Utc>>,
    pub keep_alive: Option<DateTime<Utc>>,
    pub expire_in_seconds: i64,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build a freshly-`created` record for a just-published event.
    pub fn new(event: Event, expire_in_seconds: i64) -> Self {
        Self {
            created_on: event.occurred_at,
            event,
            status: RecordStatus::Created,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            started_on: None,
            keep_alive: None,
            expire_in_seconds,
            completed_on: None,
        }
    }

    /// Eligible for claim this tick if newly created, due for retry, or
    /// stuck in an expired active claim.
    pub fn is_claimable(&self, max_retries: u32, now: DateTime<Utc>) -> bool {
        match self.status {
            RecordStatus::Created => true,
            RecordStatus::Failed => {
                self.retry_count <= max_retries
                    && self.next_retry_at.map(|t| t <= now).unwrap_or(true)
            }
            RecordStatus::Active => self
                .keep_alive
                .map(|ka| ka + ChronoDuration::seconds(self.expire_in_seconds) < now)
                .unwrap_or(false),
            RecordStatus::Completed => false,
        }
    }

    /// Claim this record for a worker: `created|eligible-failed|stuck-active -> active`.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.status = RecordStatus::Active;
        self.started_on = Some(now);
        self.keep_alive = Some(now);
    }

    /// Settle a successful handler invocation: `active -> completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = RecordStatus::Completed;
        self.completed_on = Some(now);
    }

    /// Settle a failed handler invocation, advancing `retry_count` and
    /// scheduling the next eligible attempt.
    ///
    /// Returns `true` if this failure exhausted `max_retries` (terminal
    /// dead letter), `false` if the record remains retriable.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        max_retries: u32,
        backoff: ChronoDuration,
        now: DateTime<Utc>,
    ) -> bool {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.status = RecordStatus::Failed;
        if self.retry_count > max_retries {
            self.next_retry_at = None;
            true
        } else {
            self.next_retry_at = Some(now + backoff);
            false
        }
    }

    /// Manual retry: reset to `created`, clearing retry state regardless
    /// of how terminal the record was.
    pub fn manual_retry(&mut self) {
        self.status = RecordStatus::Created;
        self.retry_count = 0;
        self.last_error = None;
        self.next_retry_at = None;
        self.started_on = None;
        self.keep_alive = None;
    }

    pub fn is_dead_letter(&self, max_retries: u32) -> bool {
        self.status == RecordStatus::Failed && self.retry_count > max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> OutboxRecord {
        OutboxRecord::new(Event::new("t", json!({})), 300)
    }

    #[test]
    fn created_is_immediately_claimable() {
        let r = record();
        assert!(r.is_claimable(5, Utc::now()));
    }

    #[test]
    fn failed_honors_next_retry_at() {
        let mut r = record();
        let now = Utc::now();
        r.claim(now);
        r.fail("boom", 5, ChronoDuration::seconds(10), now);
        assert!(!r.is_claimable(5, now));
        assert!(r.is_claimable(5, now + ChronoDuration::seconds(11)));
    }

    #[test]
    fn exhausting_retries_marks_terminal() {
        let mut r = record();
        let now = Utc::now();
        // max_retries = 5 allows 6 total invocations (the initial
        // attempt plus 5 retries) before the record goes terminal.
        for _ in 0..6 {
            r.claim(now);
            r.fail("boom", 5, ChronoDuration::seconds(0), now);
        }
        assert!(r.is_dead_letter(5));
        assert!(!r.is_claimable(5, now + ChronoDuration::seconds(100)));
    }

    #[test]
    fn manual_retry_resets_terminal_record() {
        let mut r = record();
        let now = Utc::now();
        for _ in 0..6 {
            r.claim(now);
            r.fail("boom", 5, ChronoDuration::seconds(0), now);
        }
        r.manual_retry();
        assert_eq!(r.status, RecordStatus::Created);
        assert_eq!(r.retry_count, 0);
        assert!(r.last_error.is_none());
        assert!(r.is_claimable(5, now));
    }

    #[test]
    fn active_becomes_claimable_once_stuck() {
        let mut r = record();
        r.expire_in_seconds = 300;
        let now = Utc::now();
        r.claim(now);
        assert!(!r.is_claimable(5, now));
        assert!(r.is_claimable(5, now + ChronoDuration::seconds(301)));
    }
}
