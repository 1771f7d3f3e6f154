//! Onion-style middleware executor shared by the emit and handler phases.
//!
//! The pipeline is a snapshot: callers materialize the middleware list
//! at the start of an operation (see [`crate::bus::EventBus::emit`]) so
//! a middleware registered mid-flight never affects the in-progress run.
//! Each middleware decides, by calling or not calling `next`, whether
//! the event continues inward; calling it twice is a bug in the
//! middleware and fails the operation rather than silently re-running
//! the inner stage.

use crate::event::Event;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a middleware (or the terminal stage) observed about the event.
#[derive(Debug)]
pub enum NextOutcome {
    /// The event survived the full remaining chain (and the terminal
    /// stage, if reached) — possibly mutated along the way.
    Continued(Event),
    /// Some stage dropped the event: either an explicit
    /// `next.call_dropping(..)`, or a middleware that returned without
    /// ever calling `next` at all — both are treated identically.
    Dropped,
}

pub type MiddlewareResult = Result<NextOutcome, anyhow::Error>;

/// Read-only context handed to each middleware alongside the mutable
/// event. `has_transaction` lets a middleware observe whether the
/// operation is participating in a caller transaction without handing
/// out the (adapter-specific, mutably-borrowed) transaction handle
/// itself — the handle is forwarded directly from `EventBus::emit` to
/// `Outbox::publish` instead (see design note in `DESIGN.md`).
pub struct MiddlewareContext {
    pub event: Event,
    pub has_transaction: bool,
}

/// A single stage of the pipeline.
pub type Middleware =
    Arc<dyn Fn(MiddlewareContext, Next) -> Pin<Box<dyn Future<Output = MiddlewareResult> + Send>> + Send + Sync>;

/// The innermost stage: `Outbox::publish` for the emit phase, or the
/// registered user handler for the handler phase.
pub type Terminal =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// The continuation passed to a middleware. Single-use: a second call
/// returns an error instead of re-entering the chain.
#[derive(Clone)]
pub struct Next {
    inner: Arc<NextInner>,
}

struct NextInner {
    called: AtomicBool,
    rest: Vec<Middleware>,
    has_transaction: bool,
    terminal: Terminal,
}

impl Next {
    fn new(rest: Vec<Middleware>, has_transaction: bool, terminal: Terminal) -> Self {
        Self {
            inner: Arc::new(NextInner {
                called: AtomicBool::new(false),
                rest,
                has_transaction,
                terminal,
            }),
        }
    }

    /// Continue the chain with (possibly mutated) `event`.
    pub async fn call(&self, event: Event) -> MiddlewareResult {
        self.call_inner(event, false).await
    }

    /// Continue the chain but mark the event dropped — the remaining
    /// middlewares and the terminal stage are skipped, though the
    /// calling middleware may still run cleanup after awaiting this.
    pub async fn call_dropping(&self, event: Event) -> MiddlewareResult {
        self.call_inner(event, true).await
    }

    async fn call_inner(&self, event: Event, drop_event: bool) -> MiddlewareResult {
        if self.inner.called.swap(true, Ordering::SeqCst) {
            anyhow::bail!("next() called multiple times");
        }
        if drop_event {
            return Ok(NextOutcome::Dropped);
        }
        run_from(
            self.inner.rest.clone(),
            event,
            self.inner.has_transaction,
            self.inner.terminal.clone(),
        )
        .await
    }

    fn was_called(&self) -> bool {
        self.inner.called.load(Ordering::SeqCst)
    }
}

/// Run `event` through the full snapshotted `middlewares` chain, then
/// the `terminal` stage, in strict onion order.
pub async fn run_pipeline(
    middlewares: Vec<Middleware>,
    event: Event,
    has_transaction: bool,
    terminal: Terminal,
) -> MiddlewareResult {
    run_from(middlewares, event, has_transaction, terminal).await
}

fn run_from(
    mut middlewares: Vec<Middleware>,
    event: Event,
    has_transaction: bool,
    terminal: Terminal,
) -> Pin<Box<dyn Future<Output = MiddlewareResult> + Send>> {
    Box::pin(async move {
        if middlewares.is_empty() {
            terminal(event.clone()).await?;
            return Ok(NextOutcome::Continued(event));
        }

        let mw = middlewares.remove(0);
        let rest = middlewares;
        let next = Next::new(rest, has_transaction, terminal);
        let ctx = MiddlewareContext {
            event,
            has_transaction,
        };

        let outcome = mw(ctx, next.clone()).await?;
        if !next.was_called() {
            return Ok(NextOutcome::Dropped);
        }
        Ok(outcome)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn event() -> Event {
        Event::new("t", json!({"n": 0}))
    }

    fn terminal_noop() -> Terminal {
        Arc::new(|_e| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn empty_chain_reaches_terminal() {
        let calls = Arc::new(AtomicBool::new(false));
        let calls2 = calls.clone();
        let terminal: Terminal = Arc::new(move |_e| {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let outcome = run_pipeline(vec![], event(), false, terminal).await.unwrap();
        assert!(matches!(outcome, NextOutcome::Continued(_)));
        assert!(calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn onion_order_is_before_before_handler_after_after() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let make_mw = |tag: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> Middleware {
            Arc::new(move |ctx: MiddlewareContext, next: Next| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(tag);
                    let outcome = next.call(ctx.event).await?;
                    order.lock().unwrap().push(tag);
                    Ok(outcome)
                })
            })
        };

        let terminal: Terminal = {
            let order = order.clone();
            Arc::new(move |_e| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("handler");
                    Ok(())
                })
            })
        };

        let chain = vec![
            make_mw("m1", order.clone()),
            make_mw("m2", order.clone()),
            make_mw("m3", order.clone()),
        ];

        run_pipeline(chain, event(), false, terminal).await.unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["m1", "m2", "m3", "handler", "m3", "m2", "m1"]
        );
    }

    #[tokio::test]
    async fn not_calling_next_drops_the_event() {
        let mw: Middleware = Arc::new(|_ctx, _next| Box::pin(async { Ok(NextOutcome::Dropped) }));
        let outcome = run_pipeline(vec![mw], event(), false, terminal_noop())
            .await
            .unwrap();
        assert!(matches!(outcome, NextOutcome::Dropped));
    }

    #[tokio::test]
    async fn explicit_drop_signal_skips_remaining_chain_and_terminal() {
        let reached = Arc::new(AtomicBool::new(false));
        let reached2 = reached.clone();
        let terminal: Terminal = Arc::new(move |_e| {
            let reached = reached2.clone();
            Box::pin(async move {
                reached.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let mw: Middleware = Arc::new(|ctx, next| Box::pin(next.call_dropping(ctx.event)));
        let outcome = run_pipeline(vec![mw], event(), false, terminal).await.unwrap();

        assert!(matches!(outcome, NextOutcome::Dropped));
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn calling_next_twice_fails_the_operation() {
        let mw: Middleware = Arc::new(|ctx, next| {
            Box::pin(async move {
                let _ = next.call(ctx.event.clone()).await?;
                next.call(ctx.event).await
            })
        });

        let err = run_pipeline(vec![mw], event(), false, terminal_noop())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("multiple times"));
    }

    #[tokio::test]
    async fn middleware_can_mutate_the_event_before_forwarding() {
        let mw: Middleware = Arc::new(|mut ctx, next| {
            Box::pin(async move {
                ctx.event.payload = json!({"n": 1});
                next.call(ctx.event).await
            })
        });

        let outcome = run_pipeline(vec![mw], event(), false, terminal_noop())
            .await
            .unwrap();
        match outcome {
            NextOutcome::Continued(e) => assert_eq!(e.payload, json!({"n": 1})),
            NextOutcome::Dropped => panic!("expected continuation"),
        }
    }
}
