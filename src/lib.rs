//! # bucket-relay
//!
//! Event routing and delivery for a storage bucket.
//!
//! Change and annotation events are wrapped in envelopes and fanned out by a
//! predicate-based router to durable work queues (pgmq or in-memory, with
//! bounded redelivery and dead-lettering) or to directly invoked consumers.
//! Consumers keep a per-item record store in sync and send user
//! notifications; the store's change stream drives deletion notices.

pub mod config;
pub mod consumer;
pub mod error;
pub mod model;
pub mod notifier;
pub mod pipeline;
pub mod queue;
pub mod routing;
pub mod store;
pub mod telemetry;
pub mod worker;
