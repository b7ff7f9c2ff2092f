//! In-process work queue.
//!
//! Same contract as the pgmq-backed queue. Used by tests and by
//! `serve --in-memory`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    DEAD_LETTER_RECEIVES_ATTRIBUTE, DEAD_LETTER_SOURCE_ATTRIBUTE, QueueConfig, QueueStats,
    QueuedMessage, WorkQueue,
};
use crate::error::{Error, Result};
use crate::model::Envelope;
use crate::telemetry::metrics;

struct Entry {
    envelope: Envelope,
    enqueued_at: Instant,
    visible_at: Instant,
    receive_count: u32,
    /// Receipt of the current delivery, if any.
    receipt: Option<u64>,
    first_received_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    next_receipt: u64,
    /// Keyed by id, so iteration order is enqueue order.
    entries: BTreeMap<i64, Entry>,
}

pub struct InMemoryQueue {
    name: String,
    config: QueueConfig,
    dead_letter: Option<Arc<InMemoryQueue>>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            dead_letter: None,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Route exhausted messages to `dead_letter`. Without one they are dropped.
    pub fn with_dead_letter(mut self, dead_letter: Arc<InMemoryQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, envelope: Envelope) -> i64 {
        let now = Instant::now();
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(
                id,
                Entry {
                    envelope,
                    enqueued_at: now,
                    visible_at: now + self.config.delivery_delay,
                    receive_count: 0,
                    receipt: None,
                    first_received_at: None,
                },
            );
            id
        };
        self.available.notify_waiters();
        id
    }

    /// Claim up to `max` visible messages. Exhausted messages met along the
    /// way are moved to the dead-letter queue instead of being delivered.
    fn take_visible(&self, max: usize, now: Instant) -> Vec<QueuedMessage> {
        let mut taken = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut state = self.state();

            if let Some(retention) = self.config.retention {
                let before = state.entries.len();
                state
                    .entries
                    .retain(|_, e| now.saturating_duration_since(e.enqueued_at) <= retention);
                let expired = before - state.entries.len();
                if expired > 0 {
                    debug!(queue = %self.name, expired, "dropped messages past retention");
                }
            }

            let ready: Vec<i64> = state
                .entries
                .iter()
                .filter(|(_, e)| e.visible_at <= now)
                .map(|(id, _)| *id)
                .collect();

            for id in ready {
                if taken.len() >= max {
                    break;
                }
                let exhausted_now = state
                    .entries
                    .get(&id)
                    .is_some_and(|e| self.config.retry.is_exhausted(e.receive_count));
                if exhausted_now {
                    if let Some(entry) = state.entries.remove(&id) {
                        exhausted.push((id, entry));
                    }
                    continue;
                }

                state.next_receipt += 1;
                let receipt = state.next_receipt;
                let Some(entry) = state.entries.get_mut(&id) else {
                    continue;
                };
                entry.receive_count += 1;
                entry.receipt = Some(receipt);
                entry.visible_at = now + self.config.visibility_timeout;
                let first = *entry.first_received_at.get_or_insert_with(Utc::now);
                taken.push(QueuedMessage {
                    id,
                    receipt,
                    envelope: entry.envelope.clone(),
                    receive_count: entry.receive_count,
                    first_received_at: first,
                });
            }
        }

        for (id, entry) in exhausted {
            self.move_to_dead_letter(id, entry);
        }
        taken
    }

    fn move_to_dead_letter(&self, id: i64, entry: Entry) {
        warn!(
            queue = %self.name,
            msg_id = id,
            receive_count = entry.receive_count,
            item = entry.envelope.raw_item_id(),
            "receive count exhausted, dead-lettering"
        );
        metrics::dead_lettered().add(1, &[KeyValue::new("queue", self.name.clone())]);
        let Some(ref dlq) = self.dead_letter else {
            return;
        };
        let envelope = entry
            .envelope
            .with_attribute(DEAD_LETTER_SOURCE_ATTRIBUTE, self.name.clone())
            .with_attribute(
                DEAD_LETTER_RECEIVES_ATTRIBUTE,
                entry.receive_count.to_string(),
            );
        dlq.push(envelope);
    }

    /// Earliest instant at which a currently hidden message becomes visible.
    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.state()
            .entries
            .values()
            .map(|e| e.visible_at)
            .filter(|at| *at > now)
            .min()
    }

    fn record(&self, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, envelope: &Envelope) -> Result<i64> {
        let id = self.push(envelope.clone());
        self.record("enqueue");
        Ok(id)
    }

    async fn receive(&self, batch_size: usize, max_wait: Duration) -> Result<Vec<QueuedMessage>> {
        if batch_size == 0 {
            return Err(Error::Queue("batch size must be at least 1".to_string()));
        }

        let deadline = Instant::now() + max_wait;
        let mut batch: Vec<QueuedMessage> = Vec::new();
        let mut window_end: Option<Instant> = None;

        loop {
            // Register interest before looking, so a push between the check
            // and the wait still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let taken = self.take_visible(batch_size - batch.len(), now);
            if !taken.is_empty() && window_end.is_none() {
                window_end = Some(now + self.config.max_batching_window);
            }
            batch.extend(taken);

            if batch.len() >= batch_size {
                break;
            }
            let limit = window_end.unwrap_or(deadline);
            if now >= limit {
                break;
            }
            let wake_at = self
                .next_visible_at(now)
                .map_or(limit, |at| at.min(limit));

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        self.record(if batch.is_empty() {
            "receive_empty"
        } else {
            "receive"
        });
        Ok(batch)
    }

    async fn ack(&self, message: &QueuedMessage) -> Result<bool> {
        let removed = {
            let mut state = self.state();
            let current = state
                .entries
                .get(&message.id)
                .is_some_and(|e| e.receipt == Some(message.receipt));
            if current {
                state.entries.remove(&message.id);
            }
            current
        };
        if !removed {
            debug!(queue = %self.name, msg_id = message.id, "ack for stale or unknown receipt");
        }
        self.record("ack");
        Ok(removed)
    }

    async fn nack(&self, message: &QueuedMessage) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(entry) = state.entries.get_mut(&message.id) {
                if entry.receipt == Some(message.receipt) {
                    entry.receipt = None;
                    entry.visible_at = Instant::now()
                        + self.config.retry.redelivery_delay(entry.receive_count);
                }
            }
        }
        self.available.notify_waiters();
        self.record("nack");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = Instant::now();
        let state = self.state();
        let in_flight = state
            .entries
            .values()
            .filter(|e| e.receipt.is_some() && e.visible_at > now)
            .count();
        Ok(QueueStats {
            depth: state.entries.len() as u64,
            in_flight: in_flight as u64,
        })
    }
}
