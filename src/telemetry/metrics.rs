//! Metric instrument factories for bucket-relay.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"bucket-relay"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("bucket-relay")
}

/// Counter: envelopes published into the router.
/// Labels: `event_name`, `matched` (number of subscribers, as a string).
pub fn envelopes_routed() -> Counter<u64> {
    meter()
        .u64_counter("bucket_relay.router.envelopes")
        .with_description("Number of envelopes published into the router")
        .build()
}

/// Counter: per-subscriber deliveries.
/// Labels: `subscriber`, `binding` ("queue" | "direct"), `result` ("ok" | "error").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("bucket_relay.router.deliveries")
        .with_description("Number of deliveries to subscribers")
        .build()
}

/// Counter: queue-level operations (enqueue, receive, ack, nack).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("bucket_relay.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: messages moved to a dead-letter queue.
/// Labels: `queue` (the source queue).
pub fn dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("bucket_relay.queue.dead_lettered")
        .with_description("Messages moved to a dead-letter queue")
        .build()
}

/// Counter: consumer outcomes.
/// Labels: `consumer`, `result` ("ok" | error kind).
pub fn consumer_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("bucket_relay.consumer.outcomes")
        .with_description("Outcomes of consumer invocations")
        .build()
}

/// Counter: notification attempts.
/// Labels: `template`, `result` ("sent" | "failed").
pub fn notifications() -> Counter<u64> {
    meter()
        .u64_counter("bucket_relay.notifier.requests")
        .with_description("Notification requests issued")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("bucket_relay.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
