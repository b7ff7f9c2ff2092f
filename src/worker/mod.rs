//! Queue workers: receive, hand each message to a consumer, ack or nack.

pub mod feed;
pub mod stream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::queue::{QueuedMessage, WorkQueue};
use crate::telemetry::delivery::{record_result, start_consume_span};
use crate::telemetry::metrics;

pub use feed::RouterFeed;
pub use stream::{ChangeStreamPoller, StreamConfig, StreamReport};

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    /// Long-poll wait for a receive call.
    pub receive_wait: Duration,
    /// Workers pulling from the queue.
    pub workers: usize,
    /// Cap on messages handled at once across all workers. `None` means
    /// `workers * batch_size`.
    pub max_concurrency: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            receive_wait: Duration::from_secs(10),
            workers: 1,
            max_concurrency: None,
        }
    }
}

/// Counts for one processed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub acked: usize,
    pub retried: usize,
}

/// Pulls batches from one queue and feeds them to one consumer.
#[derive(Clone)]
pub struct QueueWorker {
    queue: Arc<dyn WorkQueue>,
    consumer: Arc<dyn Consumer>,
    config: WorkerConfig,
    /// Shared by every clone, so it bounds the whole pool.
    bulkhead: Arc<Semaphore>,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn WorkQueue>, consumer: Arc<dyn Consumer>, config: WorkerConfig) -> Self {
        let permits = config
            .max_concurrency
            .unwrap_or(config.workers.max(1) * config.batch_size.max(1))
            .max(1);
        Self {
            queue,
            consumer,
            config,
            bulkhead: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Spawn `config.workers` loops that run until `shutdown` is cancelled.
    pub fn spawn_pool(&self, tasks: &mut JoinSet<()>, shutdown: &CancellationToken) {
        for index in 0..self.config.workers.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.run(index, shutdown).await });
        }
    }

    /// Receive and process until cancelled. An empty receive just loops.
    pub async fn run(&self, index: usize, shutdown: CancellationToken) {
        info!(
            queue = self.queue.name(),
            consumer = self.consumer.name(),
            worker = index,
            "queue worker started"
        );
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(self.config.batch_size, self.config.receive_wait) => received,
            };

            match received {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => {
                    let report = self.process_batch(batch).await;
                    debug!(
                        queue = self.queue.name(),
                        acked = report.acked,
                        retried = report.retried,
                        "batch processed"
                    );
                }
                Err(e) => {
                    error!(queue = self.queue.name(), error = %e, "receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!(queue = self.queue.name(), worker = index, "queue worker stopped");
    }

    /// Handle the messages of a batch concurrently, each on its own. A
    /// message is acked as soon as its consumer finished; a failure leaves
    /// it for redelivery and does not affect its neighbours. The bulkhead
    /// bounds how many run at once across the pool.
    pub async fn process_batch(&self, batch: Vec<QueuedMessage>) -> BatchReport {
        let mut tasks = JoinSet::new();
        for message in batch {
            let worker = self.clone();
            tasks.spawn(async move { worker.settle(message).await });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => report.acked += 1,
                Ok(false) => report.retried += 1,
                Err(e) => {
                    // Unsettled; the visibility timeout brings it back.
                    error!(queue = self.queue.name(), error = %e, "message task panicked");
                    report.retried += 1;
                }
            }
        }
        report
    }

    /// Process one message and ack or nack it. True when it was acked.
    async fn settle(&self, message: QueuedMessage) -> bool {
        match self.process_message(&message).await {
            Ok(()) => match self.queue.ack(&message).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(queue = self.queue.name(), msg_id = message.id, "ack came too late");
                    false
                }
                Err(e) => {
                    error!(queue = self.queue.name(), msg_id = message.id, error = %e, "ack failed");
                    false
                }
            },
            Err(_) => {
                if let Err(e) = self.queue.nack(&message).await {
                    // The visibility timeout will bring it back anyway.
                    warn!(queue = self.queue.name(), msg_id = message.id, error = %e, "nack failed");
                }
                false
            }
        }
    }

    async fn process_message(&self, message: &QueuedMessage) -> Result<()> {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| Error::Other(format!("bulkhead closed: {e}")))?;

        let span = start_consume_span(
            self.consumer.name(),
            &message.envelope.id,
            message.receive_count,
        );
        let start = Instant::now();
        let result = self
            .consumer
            .handle(&message.envelope)
            .instrument(span.clone())
            .await;
        record_result(&span, self.consumer.name(), &result);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1_000.0,
            &[opentelemetry::KeyValue::new("operation", "consume")],
        );

        if let Err(ref e) = result {
            span.in_scope(|| {
                if e.is_terminal() {
                    warn!(
                        msg_id = message.id,
                        receive_count = message.receive_count,
                        error = %e,
                        "message rejected, leaving it for redelivery"
                    );
                } else {
                    error!(
                        msg_id = message.id,
                        receive_count = message.receive_count,
                        error = %e,
                        "consumer failed, leaving message for redelivery"
                    );
                }
            });
        }
        result
    }
}
