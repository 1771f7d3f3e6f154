//! Prometheus metrics for the bus and its adapters, using a
//! `const_label("service", ...)` convention so every metric this crate
//! exports can be told apart from another service's outbox in a shared
//! registry.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct BusMetrics {
    pub events_published: IntCounter,
    pub events_delivered: IntCounter,
    pub events_dead_lettered: IntCounter,
    pub handler_duration_seconds: Histogram,
    pub polling_errors: IntCounter,
}

impl BusMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let events_published = IntCounter::with_opts(
            Opts::new("outbox_bus_events_published_total", "Events accepted by Outbox::publish")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_bus_events_published_total");

        let events_delivered = IntCounter::with_opts(
            Opts::new(
                "outbox_bus_events_delivered_total",
                "Events for which the registered handler returned successfully",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_bus_events_delivered_total");

        let events_dead_lettered = IntCounter::with_opts(
            Opts::new(
                "outbox_bus_events_dead_lettered_total",
                "Events that exhausted max_retries and became terminal",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_bus_events_dead_lettered_total");

        let handler_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "outbox_bus_handler_duration_seconds",
                "Time spent inside a single handler invocation",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_bus_handler_duration_seconds");

        let polling_errors = IntCounter::with_opts(
            Opts::new("outbox_bus_polling_errors_total", "Polling ticks that failed before reaching a handler")
                .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for outbox_bus_polling_errors_total");

        for metric in [
            Box::new(events_published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_delivered.clone()),
            Box::new(events_dead_lettered.clone()),
            Box::new(handler_duration_seconds.clone()),
            Box::new(polling_errors.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register outbox bus metric: {}", e);
            }
        }

        Self {
            events_published,
            events_delivered,
            events_dead_lettered,
            handler_duration_seconds,
            polling_errors,
        }
    }
}
