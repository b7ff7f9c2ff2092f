//! Span helpers for message delivery.
//!
//! Every message a consumer handles runs inside a `consume` span so that
//! store and notifier calls made on its behalf are attributed to it.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one consumer invocation.
///
/// The `consume.outcome` field is declared empty and filled by
/// [`record_outcome`].
pub fn start_consume_span(consumer: &str, envelope_id: &Uuid, receive_count: u32) -> Span {
    tracing::info_span!(
        "consume",
        "consume.consumer" = consumer,
        "consume.envelope_id" = %envelope_id,
        "consume.receive_count" = receive_count,
        "consume.outcome" = tracing::field::Empty,
    )
}

/// Record how the invocation ended ("ok" or an error kind).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("consume.outcome", outcome);
}

/// Close out an invocation: fill the span's outcome and count it.
pub fn record_result(span: &Span, consumer: &str, result: &crate::error::Result<()>) {
    let outcome = match result {
        Ok(()) => "ok",
        Err(e) => e.kind(),
    };
    record_outcome(span, outcome);
    super::metrics::consumer_outcomes().add(
        1,
        &[
            opentelemetry::KeyValue::new("consumer", consumer.to_string()),
            opentelemetry::KeyValue::new("result", outcome),
        ],
    );
}
