//! pgmq-backed work queue via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.delete, pgmq.archive. pgmq counts reads itself (`read_ct`), which is
//! the receive count. Dead-lettering is a send to the DLQ plus a delete from
//! the source, in one transaction.
//!
//! A delivery's receipt is the `vt` it was read with. Ack and nack touch the
//! row only while that `vt` is unchanged, so a worker that overran its
//! visibility window cannot remove or reschedule someone else's delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgPool;
use tracing::{error, warn};

use super::{
    DEAD_LETTER_RECEIVES_ATTRIBUTE, DEAD_LETTER_SOURCE_ATTRIBUTE, QueueConfig, QueueStats,
    QueuedMessage, WorkQueue,
};
use crate::error::{Error, Result};
use crate::model::Envelope;
use crate::telemetry::metrics;

/// How often `read_with_poll` re-checks an empty queue.
const POLL_INTERVAL_MS: i32 = 100;

type MessageRow = (i64, i32, DateTime<Utc>, DateTime<Utc>, serde_json::Value);

pub struct PgmqQueue {
    pool: PgPool,
    name: String,
    dead_letter: Option<String>,
    config: QueueConfig,
}

impl PgmqQueue {
    /// Bind to a queue, creating it (and its dead-letter queue) if needed.
    pub async fn create(
        pool: PgPool,
        name: &str,
        dead_letter: Option<&str>,
        config: QueueConfig,
    ) -> Result<Self> {
        validate_queue_name(name)?;
        if let Some(dlq) = dead_letter {
            validate_queue_name(dlq)?;
        }

        for queue in std::iter::once(name).chain(dead_letter) {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(queue)
                .execute(&pool)
                .await?;
        }

        Ok(Self {
            pool,
            name: name.to_string(),
            dead_letter: dead_letter.map(str::to_string),
            config,
        })
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

    /// Move an exhausted message to the dead-letter queue (or drop it when
    /// none is configured).
    async fn move_to_dead_letter(&self, msg_id: i64, read_ct: i32, envelope: Envelope) -> Result<()> {
        warn!(
            queue = %self.name,
            msg_id,
            receive_count = read_ct - 1,
            item = envelope.raw_item_id(),
            "receive count exhausted, dead-lettering"
        );

        let mut tx = self.pool.begin().await?;
        if let Some(ref dlq) = self.dead_letter {
            let envelope = envelope
                .with_attribute(DEAD_LETTER_SOURCE_ATTRIBUTE, self.name.clone())
                .with_attribute(DEAD_LETTER_RECEIVES_ATTRIBUTE, (read_ct - 1).to_string());
            let payload = serde_json::to_value(&envelope)?;
            sqlx::query("SELECT pgmq.send($1, $2, 0)")
                .bind(dlq)
                .bind(&payload)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(&self.name)
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        metrics::dead_lettered().add(1, &[KeyValue::new("queue", self.name.clone())]);
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgmqQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, envelope: &Envelope) -> Result<i64> {
        let payload = serde_json::to_value(envelope)?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(&self.name)
            .bind(&payload)
            .bind(whole_seconds(self.config.delivery_delay))
            .fetch_one(&self.pool)
            .await?;
        self.record("enqueue");
        Ok(row.0)
    }

    async fn receive(&self, batch_size: usize, max_wait: Duration) -> Result<Vec<QueuedMessage>> {
        if batch_size == 0 {
            return Err(Error::Queue("batch size must be at least 1".to_string()));
        }

        // pgmq returns as soon as any message is available, so the batching
        // window is a second read that tops the batch up.
        let mut rows = self.read(batch_size, max_wait).await?;
        if !rows.is_empty() && rows.len() < batch_size && !self.config.max_batching_window.is_zero() {
            let more = self
                .read(batch_size - rows.len(), self.config.max_batching_window)
                .await?;
            rows.extend(more);
        }

        let mut batch = Vec::with_capacity(rows.len());
        for (msg_id, read_ct, enqueued_at, vt, message) in rows {
            let envelope: Envelope = match serde_json::from_value(message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // No consumer can ever take it. The archive table keeps
                    // it for an operator.
                    error!(queue = %self.name, msg_id, error = %e, "undecodable message, archiving");
                    if let Err(e) = self.archive(msg_id).await {
                        error!(queue = %self.name, msg_id, error = %e, "archive failed");
                    }
                    continue;
                }
            };
            let read_ct = read_ct.max(1);
            // read_ct already counts this read; the message is exhausted if
            // its earlier deliveries alone used up the policy.
            if self.config.retry.is_exhausted((read_ct - 1) as u32) {
                if let Err(e) = self.move_to_dead_letter(msg_id, read_ct, envelope).await {
                    // Still in the source queue; it shows up again at its vt.
                    error!(queue = %self.name, msg_id, error = %e, "dead-lettering failed");
                }
                continue;
            }
            batch.push(QueuedMessage {
                id: msg_id,
                receipt: receipt_for(vt),
                envelope,
                receive_count: read_ct as u32,
                first_received_at: enqueued_at,
            });
        }

        self.record(if batch.is_empty() {
            "receive_empty"
        } else {
            "receive"
        });
        Ok(batch)
    }

    async fn ack(&self, message: &QueuedMessage) -> Result<bool> {
        // The name was validated at construction, so it is safe to splice.
        let sql = format!(
            "DELETE FROM pgmq.q_{} WHERE msg_id = $1 AND vt = $2 RETURNING msg_id",
            self.name
        );
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(message.id)
            .bind(visible_at(message.receipt)?)
            .fetch_optional(&self.pool)
            .await?;
        self.record("ack");
        Ok(row.is_some())
    }

    async fn nack(&self, message: &QueuedMessage) -> Result<()> {
        let delay = self.config.retry.redelivery_delay(message.receive_count);
        let sql = format!(
            "UPDATE pgmq.q_{} SET vt = clock_timestamp() + make_interval(secs => $3)
             WHERE msg_id = $1 AND vt = $2",
            self.name
        );
        let updated = sqlx::query(&sql)
            .bind(message.id)
            .bind(visible_at(message.receipt)?)
            .bind(delay.as_secs_f64())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            warn!(queue = %self.name, msg_id = message.id, "nack for a stale delivery ignored");
        }
        self.record("nack");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        // The name was validated at construction, so it is safe to splice.
        let sql = format!(
            "SELECT count(*), count(*) FILTER (WHERE vt > now() AND read_ct > 0) FROM pgmq.q_{}",
            self.name
        );
        let (depth, in_flight): (i64, i64) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            depth: depth as u64,
            in_flight: in_flight as u64,
        })
    }
}

impl PgmqQueue {
    async fn archive(&self, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&self.name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        metrics::dead_lettered().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("reason", "undecodable"),
            ],
        );
        Ok(())
    }

    async fn read(&self, qty: usize, wait: Duration) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT msg_id, read_ct, enqueued_at, vt, message
             FROM pgmq.read_with_poll($1, $2, $3, $4, $5)",
        )
        .bind(&self.name)
        .bind(whole_seconds(self.config.visibility_timeout).max(1))
        .bind(qty as i32)
        .bind(whole_seconds(wait))
        .bind(POLL_INTERVAL_MS)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn receipt_for(vt: DateTime<Utc>) -> u64 {
    vt.timestamp_micros() as u64
}

/// The `vt` a receipt was issued for. Postgres keeps microseconds, so this
/// is exact.
fn visible_at(receipt: u64) -> Result<DateTime<Utc>> {
    i64::try_from(receipt)
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| Error::Queue(format!("malformed receipt {receipt}")))
}

fn whole_seconds(duration: Duration) -> i32 {
    duration.as_secs().min(i32::MAX as u64) as i32
}

/// pgmq queue names become table names; keep them to `[a-z0-9_]`.
fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 47
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid queue name: {name:?}")))
    }
}
