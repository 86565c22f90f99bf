//! Metric instrument factories for audit-worker.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"audit-worker"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for audit-worker instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("audit-worker")
}

/// Counter: notifications handled successfully (acknowledged).
/// Labels: `path` ("primary" | "dead_letter"), `disposition`.
pub fn notifications_processed() -> Counter<u64> {
    meter()
        .u64_counter("audit.notifications.processed")
        .with_description("Notifications acknowledged, by disposition")
        .build()
}

/// Counter: notifications whose handling failed and will be redelivered.
/// Labels: `path`.
pub fn notifications_failed() -> Counter<u64> {
    meter()
        .u64_counter("audit.notifications.failed")
        .with_description("Notifications left for redelivery after an error")
        .build()
}

/// Counter: report artifact uploads.
/// Labels: `format` ("json" | "html"), `result` ("ok" | "error").
pub fn artifact_uploads() -> Counter<u64> {
    meter()
        .u64_counter("audit.artifacts.uploads")
        .with_description("Report artifact uploads")
        .build()
}

/// Counter: run ledger inserts.
/// Labels: `result` ("inserted" | "conflict").
pub fn ledger_writes() -> Counter<u64> {
    meter()
        .u64_counter("audit.ledger.writes")
        .with_description("Run ledger conditional inserts")
        .build()
}

/// Counter: queue-level operations (publish, receive, ack, dead_letter).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("audit.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: audit engine wall time in milliseconds.
/// Labels: `result` ("ok" | "error").
pub fn audit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("audit.engine.duration_ms")
        .with_description("Audit engine run duration in milliseconds")
        .with_unit("ms")
        .build()
}
