//! Span helpers for records and jobs flowing through the bridge.

use crate::model::job::JobId;
use crate::model::{Offset, TopicPartition};
use tracing::Span;

/// Start a span for a publish call.
///
/// The `relay.offset` field is declared empty and filled via
/// [`record_offset`] once the log acknowledges the record.
pub fn start_publish_span(key: &str, mode: &str) -> Span {
    tracing::info_span!(
        "relay.publish",
        "relay.key" = key,
        "relay.mode" = mode,
        "relay.offset" = tracing::field::Empty,
    )
}

/// Start a span for applying one log record to the cache.
pub fn start_apply_span(tp: &TopicPartition, key: &str, offset: Offset) -> Span {
    tracing::info_span!(
        "relay.apply",
        "relay.partition" = %tp,
        "relay.key" = key,
        "relay.offset" = offset,
    )
}

/// Start a span for one job execution on a pool worker.
pub fn start_job_span(worker: usize, job_id: &JobId) -> Span {
    tracing::info_span!(
        "pool.job",
        "pool.worker" = worker,
        "pool.job_id" = %job_id,
    )
}

/// Record the acknowledged offset on a publish span.
pub fn record_offset(span: &Span, offset: Offset) {
    span.record("relay.offset", offset);
}
