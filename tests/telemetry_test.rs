//! Integration tests for telemetry initialization and span helpers.

use bucket_relay::error::Error;
use bucket_relay::telemetry::delivery::{record_outcome, record_result, start_consume_span};
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = bucket_relay::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "bucket-relay-test".to_string(),
        default_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = bucket_relay::telemetry::init_telemetry(config);
}

#[test]
fn consume_span_records_outcome() {
    let id = Uuid::new_v4();
    let span = start_consume_span("ingest", &id, 2);
    record_outcome(&span, "ok");
}

#[test]
fn consume_span_records_error_kind() {
    let id = Uuid::new_v4();
    let span = start_consume_span("description", &id, 1);
    record_result(&span, "description", &Err(Error::NotFound("ghost.png".into())));
    record_result(&span, "description", &Ok(()));
}
