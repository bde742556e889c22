//! Metric instrument factories for relay-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"relay-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for relay-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("relay-rs")
}

/// Counter: publish calls.
/// Labels: `mode` ("async" | "sync"), `result` ("enqueued" | "acknowledged" | "error").
pub fn records_published() -> Counter<u64> {
    meter()
        .u64_counter("relay.publisher.records")
        .with_description("Number of publish calls")
        .build()
}

/// Counter: delivery outcomes observed by the outcome handler.
/// Labels: `result` ("delivered" | "failed").
pub fn delivery_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("relay.publisher.outcomes")
        .with_description("Number of delivery outcomes")
        .build()
}

/// Counter: records read by the subscriber.
/// Labels: `result` ("applied" | "skipped").
pub fn records_applied() -> Counter<u64> {
    meter()
        .u64_counter("relay.subscriber.records")
        .with_description("Number of log records processed by the subscriber")
        .build()
}

/// Counter: republish fan-out per key.
/// Labels: `result` ("published" | "missing" | "error").
pub fn records_republished() -> Counter<u64> {
    meter()
        .u64_counter("relay.bridge.republished")
        .with_description("Number of cached records re-published")
        .build()
}

/// Counter: durable log operations.
/// Labels: `backend`, `operation`.
pub fn log_operations() -> Counter<u64> {
    meter()
        .u64_counter("relay.log.operations")
        .with_description("Number of durable log operations")
        .build()
}

/// Counter: cache operations.
/// Labels: `backend`, `operation`.
pub fn cache_operations() -> Counter<u64> {
    meter()
        .u64_counter("relay.cache.operations")
        .with_description("Number of cache operations")
        .build()
}

/// Counter: job submissions to the worker pool.
/// Labels: `result` ("accepted" | "full" | "closed").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("relay.pool.submitted")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: jobs executed by pool workers.
pub fn jobs_executed() -> Counter<u64> {
    meter()
        .u64_counter("relay.pool.executed")
        .with_description("Number of jobs executed")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
