//! Metric instrument factories for taskcast.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskcast"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for taskcast instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskcast")
}

/// Counter: tasks accepted by `enqueue`.
/// Labels: `kind`, `lane`, `result` ("ok" | "error").
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskcast.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: attempt outcomes.
/// Labels: `kind`, `outcome` ("succeeded" | "retrying" | "failed").
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("taskcast.tasks.outcomes")
        .with_description("Number of task attempts by outcome")
        .build()
}

/// Histogram: callback wall time per attempt, in seconds.
/// Labels: `kind`.
pub fn task_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("taskcast.tasks.duration")
        .with_description("Task attempt duration")
        .with_unit("s")
        .build()
}

/// Counter: queue-level operations (send, read, archive, delete, requeue).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskcast.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: events published on the in-process bus.
/// Labels: `status`.
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("taskcast.events.published")
        .with_description("Number of lifecycle events published")
        .build()
}

/// Up/down counter: open live connections.
pub fn gateway_connections() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("taskcast.gateway.connections")
        .with_description("Open WebSocket connections")
        .build()
}
