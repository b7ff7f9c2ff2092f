//! Work queues with bounded redelivery and dead-lettering.
//!
//! Delivery is at-least-once. A received message stays invisible for the
//! visibility window; if it is not acked in time (or is nacked) it becomes
//! visible again. Once its receive count exceeds the retry policy's
//! `max_receive_count`, the next redelivery moves it to the dead-letter queue
//! instead. That move is the only escalation path for failed messages.

pub mod memory;
pub mod pgmq;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Envelope;

pub use memory::InMemoryQueue;
pub use pgmq::PgmqQueue;

/// Attribute stamped on dead-lettered envelopes naming the source queue.
pub const DEAD_LETTER_SOURCE_ATTRIBUTE: &str = "dead_letter.source";
/// Attribute stamped on dead-lettered envelopes with the final receive count.
pub const DEAD_LETTER_RECEIVES_ATTRIBUTE: &str = "dead_letter.receive_count";

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay before a failed message may be delivered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay after the given (1-based) attempt failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(31);
                let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Decides when a message is terminal. Shared by queues (dead-letter
/// threshold, nack delay) and by direct invocation (retry count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_receive_count: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_receive_count: u32, backoff: Backoff) -> Self {
        Self {
            max_receive_count,
            backoff,
        }
    }

    /// No retries: the first failure is final.
    pub fn none() -> Self {
        Self::new(0, Backoff::Fixed { delay_ms: 0 })
    }

    /// Has a message received this many times used up its deliveries?
    pub fn is_exhausted(&self, receive_count: u32) -> bool {
        receive_count > self.max_receive_count
    }

    /// Total deliveries a message gets before it is dead-lettered.
    pub fn max_attempts(&self) -> u32 {
        self.max_receive_count.saturating_add(1)
    }

    pub fn redelivery_delay(&self, receive_count: u32) -> Duration {
        self.backoff.delay(receive_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Backoff::Fixed { delay_ms: 0 })
    }
}

// ---------------------------------------------------------------------------
// Queue configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a received message stays hidden from other receivers.
    pub visibility_timeout: Duration,
    /// Delay before a newly enqueued message becomes visible.
    pub delivery_delay: Duration,
    /// How long a receive may keep waiting to fill a batch once it holds
    /// at least one message.
    pub max_batching_window: Duration,
    /// Messages older than this are dropped. `None` keeps them forever.
    pub retention: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            delivery_delay: Duration::ZERO,
            max_batching_window: Duration::ZERO,
            retention: None,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A delivered message. Hand it back to [`WorkQueue::ack`] or
/// [`WorkQueue::nack`] unchanged.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: i64,
    /// Identifies this particular delivery; a redelivery gets a new one.
    pub receipt: u64,
    pub envelope: Envelope,
    /// Number of times the message has been received, this delivery included.
    pub receive_count: u32,
    pub first_received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// All messages still held by the queue.
    pub depth: u64,
    /// Messages currently received and hidden.
    pub in_flight: u64,
}

// ---------------------------------------------------------------------------
// Queue trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append to the tail. Never waits on consumers.
    async fn enqueue(&self, envelope: &Envelope) -> Result<i64>;

    /// Receive up to `batch_size` messages, waiting up to `max_wait` when
    /// none are available. An empty batch is a normal outcome.
    async fn receive(&self, batch_size: usize, max_wait: Duration) -> Result<Vec<QueuedMessage>>;

    /// Remove a message for good. Returns false if it was already gone or
    /// has since been redelivered under another receipt.
    async fn ack(&self, message: &QueuedMessage) -> Result<bool>;

    /// Give a message back early; it becomes visible after the retry
    /// policy's backoff instead of at the end of the visibility window.
    async fn nack(&self, message: &QueuedMessage) -> Result<()>;

    async fn stats(&self) -> Result<QueueStats>;
}
