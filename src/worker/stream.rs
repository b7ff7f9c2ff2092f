//! Change-stream poller with error-bisecting delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::consumer::ChangeHandler;
use crate::error::{Error, Result};
use crate::store::{ChangeRecord, ChangeStream, StreamPosition};
use crate::telemetry::delivery::record_result;

/// How often a running poller trims expired changes.
const TRIM_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub batch_size: usize,
    pub start: StreamPosition,
    /// Sleep between reads when the stream has nothing new.
    pub poll_interval: Duration,
    /// Extra attempts for a single failing record before it is skipped.
    pub retry_attempts: u32,
    /// Changes older than this are trimmed from the stream. `None` keeps
    /// them forever.
    pub retention: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            start: StreamPosition::TrimHorizon,
            poll_interval: Duration::from_secs(1),
            retry_attempts: 2,
            retention: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Outcome of delivering one batch read from the stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub delivered: usize,
    pub skipped: usize,
    pub handler_calls: usize,
}

pub struct ChangeStreamPoller {
    stream: Arc<dyn ChangeStream>,
    handler: Arc<dyn ChangeHandler>,
    config: StreamConfig,
}

impl ChangeStreamPoller {
    pub fn new(stream: Arc<dyn ChangeStream>, handler: Arc<dyn ChangeHandler>, config: StreamConfig) -> Self {
        Self {
            stream,
            handler,
            config,
        }
    }

    /// Poll until cancelled, starting from the configured position.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut cursor = self.stream.resolve(self.config.start).await?;
        info!(handler = self.handler.name(), cursor, "change stream poller started");

        let mut last_trim: Option<Instant> = None;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if last_trim.is_none_or(|at| at.elapsed() >= TRIM_INTERVAL) {
                last_trim = Some(Instant::now());
                if let Err(e) = self.trim_expired().await {
                    warn!(handler = self.handler.name(), error = %e, "change stream trim failed");
                }
            }
            let idle = match self.poll_once(cursor).await {
                Ok((next, read)) => {
                    cursor = next;
                    read < self.config.batch_size
                }
                Err(e) => {
                    error!(handler = self.handler.name(), cursor, error = %e, "change stream read failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(handler = self.handler.name(), cursor, "change stream poller stopped");
        Ok(())
    }

    /// Drop changes older than the retention window.
    pub async fn trim_expired(&self) -> Result<u64> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::Config(format!("stream retention out of range: {e}")))?;
        let removed = self.stream.trim(Utc::now() - retention).await?;
        if removed > 0 {
            debug!(handler = self.handler.name(), removed, "expired changes trimmed");
        }
        Ok(removed)
    }

    /// Read one batch after `cursor` and deliver it. Returns the new cursor
    /// and the number of records read. The cursor always moves past the
    /// batch, including records that were skipped.
    pub async fn poll_once(&self, cursor: u64) -> Result<(u64, usize)> {
        let batch = self
            .stream
            .read_after(cursor, self.config.batch_size.max(1))
            .await?;
        let Some(last) = batch.last() else {
            return Ok((cursor, 0));
        };
        let next = last.sequence;

        let report = self.deliver(&batch).await;
        debug!(
            handler = self.handler.name(),
            read = batch.len(),
            delivered = report.delivered,
            skipped = report.skipped,
            cursor = next,
            "change batch delivered"
        );
        Ok((next, batch.len()))
    }

    /// Deliver `batch`, halving any range the handler rejects. Ranges are
    /// handled in stream order.
    pub async fn deliver(&self, batch: &[ChangeRecord]) -> StreamReport {
        let mut report = StreamReport::default();
        let mut pending: Vec<&[ChangeRecord]> = vec![batch];

        while let Some(range) = pending.pop() {
            if range.is_empty() {
                continue;
            }
            report.handler_calls += 1;
            match self.invoke(range).await {
                Ok(()) => report.delivered += range.len(),
                Err(e) if range.len() > 1 => {
                    warn!(
                        handler = self.handler.name(),
                        size = range.len(),
                        error = %e,
                        "change batch failed, bisecting"
                    );
                    let (head, tail) = range.split_at(range.len() / 2);
                    pending.push(tail);
                    pending.push(head);
                }
                Err(e) => {
                    let (delivered, calls) = self.retry_single(range, e).await;
                    report.handler_calls += calls;
                    if delivered {
                        report.delivered += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
            }
        }
        report
    }

    async fn retry_single(&self, record: &[ChangeRecord], mut last: Error) -> (bool, usize) {
        let mut calls = 0;
        for attempt in 1..=self.config.retry_attempts {
            calls += 1;
            match self.invoke(record).await {
                Ok(()) => return (true, calls),
                Err(e) => {
                    debug!(handler = self.handler.name(), attempt, error = %e, "change record retry failed");
                    last = e;
                }
            }
        }
        let sequence = record.first().map(|r| r.sequence).unwrap_or_default();
        error!(
            handler = self.handler.name(),
            sequence,
            attempts = self.config.retry_attempts + 1,
            error = %last,
            "skipping change record"
        );
        (false, calls)
    }

    async fn invoke(&self, records: &[ChangeRecord]) -> Result<()> {
        let first = records.first().map(|r| r.sequence).unwrap_or_default();
        let span = info_span!(
            "consume",
            "consume.consumer" = self.handler.name(),
            "consume.first_sequence" = first,
            "consume.records" = records.len(),
            "consume.outcome" = tracing::field::Empty,
        );
        let result = self
            .handler
            .handle_changes(records)
            .instrument(span.clone())
            .await;
        record_result(&span, self.handler.name(), &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Operation;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Rejects any batch containing one of the poisoned sequences.
    struct Poisoned {
        poisoned: Vec<u64>,
        seen: Mutex<Vec<Vec<u64>>>,
    }

    #[async_trait]
    impl ChangeHandler for Poisoned {
        fn name(&self) -> &str {
            "poisoned"
        }

        async fn handle_changes(&self, changes: &[ChangeRecord]) -> Result<()> {
            let seqs: Vec<u64> = changes.iter().map(|c| c.sequence).collect();
            self.seen.lock().unwrap().push(seqs.clone());
            if seqs.iter().any(|s| self.poisoned.contains(s)) {
                return Err(Error::Store("poisoned".into()));
            }
            Ok(())
        }
    }

    struct NoStream;

    #[async_trait]
    impl ChangeStream for NoStream {
        async fn read_after(&self, _after: u64, _limit: usize) -> Result<Vec<ChangeRecord>> {
            Ok(Vec::new())
        }

        async fn latest_sequence(&self) -> Result<u64> {
            Ok(0)
        }

        async fn trim(&self, _horizon: chrono::DateTime<chrono::Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    fn records(n: u64) -> Vec<ChangeRecord> {
        (1..=n)
            .map(|sequence| ChangeRecord {
                sequence,
                operation: Operation::Insert,
                before: None,
                after: None,
                recorded_at: chrono::Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn bisection_isolates_the_poisoned_record() {
        let handler = Arc::new(Poisoned {
            poisoned: vec![3],
            seen: Mutex::new(Vec::new()),
        });
        let poller = ChangeStreamPoller::new(Arc::new(NoStream), handler.clone(), StreamConfig::default());

        let report = poller.deliver(&records(4)).await;

        assert_eq!(report.delivered, 3);
        assert_eq!(report.skipped, 1);
        let seen = handler.seen.lock().unwrap();
        // Whole batch, then [1,2] and [3,4], then [3] and its retries, then [4].
        assert_eq!(seen[0], vec![1, 2, 3, 4]);
        assert_eq!(seen[1], vec![1, 2]);
        assert_eq!(seen[2], vec![3, 4]);
        assert_eq!(seen.iter().filter(|s| s.as_slice() == [3]).count(), 3);
        assert_eq!(seen.last().unwrap(), &vec![4]);
    }

    #[tokio::test]
    async fn trim_honours_the_retention_window() {
        use crate::model::ItemFields;
        use crate::store::{InMemoryStore, RecordStore};

        let store = Arc::new(InMemoryStore::new());
        store.upsert("a.png", ItemFields::default()).await.unwrap();
        let handler = Arc::new(Poisoned {
            poisoned: vec![],
            seen: Mutex::new(Vec::new()),
        });

        let keep = ChangeStreamPoller::new(store.clone(), handler.clone(), StreamConfig::default());
        assert_eq!(keep.trim_expired().await.unwrap(), 0);

        let forever = StreamConfig {
            retention: None,
            ..StreamConfig::default()
        };
        let forever = ChangeStreamPoller::new(store.clone(), handler.clone(), forever);
        assert_eq!(forever.trim_expired().await.unwrap(), 0);

        let expire_all = StreamConfig {
            retention: Some(Duration::ZERO),
            ..StreamConfig::default()
        };
        // Make sure the change is strictly older than "now".
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expire_all = ChangeStreamPoller::new(store.clone(), handler, expire_all);
        assert_eq!(expire_all.trim_expired().await.unwrap(), 1);
        assert!(store.read_after(0, 10).await.unwrap().is_empty());
    }
}
