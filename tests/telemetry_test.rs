//! Integration tests for telemetry initialization and span helpers.

use relay_rs::model::TopicPartition;
use relay_rs::model::job::JobId;
use relay_rs::telemetry::spans;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    let config = relay_rs::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "relay-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = relay_rs::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn telemetry_config_follows_app_config() {
    let config = relay_rs::config::Config {
        otel_endpoint: Some("http://localhost:4317".to_string()),
        log_level: "warn".to_string(),
        ..Default::default()
    };
    let telemetry = relay_rs::telemetry::TelemetryConfig::from_config(&config, "relay");
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.service_name, "relay");
    assert_eq!(telemetry.log_level, "warn");
}

#[test]
fn publish_span_records_offset() {
    let span = spans::start_publish_span("message:abc", "sync");
    spans::record_offset(&span, 42);
}

#[test]
fn apply_and_job_spans_create() {
    let _apply = spans::start_apply_span(&TopicPartition::new("testTopic", 0), "message:abc", 7);
    let _job = spans::start_job_span(3, &JobId::new());
}

#[test]
fn job_id_displays_short_form() {
    let id = JobId::new();
    assert_eq!(id.to_string().len(), 8);
    assert!(id.0.to_string().starts_with(&id.to_string()));
}
