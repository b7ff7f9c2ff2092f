//! Pipeline settings loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) gives the stock
//! topology. Created items and caption annotations go through durable work
//! queues into ingest and description, so a failure there is redelivered and
//! finally dead-lettered into a rejection notice. The confirmation notice
//! and removals are invoked directly.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::consumer::ExtensionAllowlist;
use crate::error::{Error, Result};
use crate::model::{COMMENT_TYPE_ATTRIBUTE, ChangeKind};
use crate::queue::{Backoff, QueueConfig, RetryPolicy};
use crate::routing::Predicate;
use crate::store::StreamPosition;
use crate::worker::{StreamConfig, WorkerConfig};

/// Subscribers a route may name.
pub const SUBSCRIBERS: [&str; 4] = ["ingest", "removal", "description", "confirmation"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Work queues for queue-bound subscribers.
    pub queue: QueueSettings,
    pub dead_letter: DeadLetterSettings,
    /// Queue that producers enqueue raw envelopes on.
    pub inbound: InboundSettings,
    pub stream: StreamSettings,
    pub direct_retry: DirectRetrySettings,
    pub validation: ValidationSettings,
    /// Empty means [`default_routes`].
    pub routes: Vec<RouteSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub batch_size: usize,
    pub receive_wait_secs: u64,
    pub batching_window_secs: u64,
    pub visibility_timeout_secs: u64,
    pub delivery_delay_secs: u64,
    pub max_receive_count: u32,
    pub retry_backoff_ms: u64,
    pub workers: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            receive_wait_secs: 10,
            batching_window_secs: 10,
            visibility_timeout_secs: 30,
            delivery_delay_secs: 0,
            max_receive_count: 1,
            retry_backoff_ms: 0,
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeadLetterSettings {
    pub batch_size: usize,
    pub receive_wait_secs: u64,
    pub batching_window_secs: u64,
    pub max_concurrency: usize,
    pub retention_secs: u64,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            receive_wait_secs: 10,
            batching_window_secs: 5,
            max_concurrency: 2,
            retention_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InboundSettings {
    pub batch_size: usize,
    pub receive_wait_secs: u64,
    pub visibility_timeout_secs: u64,
    pub workers: usize,
}

impl Default for InboundSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            receive_wait_secs: 10,
            visibility_timeout_secs: 30,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    pub batch_size: usize,
    pub start: StreamPosition,
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    /// Age at which changes are trimmed. 0 keeps them forever.
    pub retention_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            start: StreamPosition::TrimHorizon,
            poll_interval_ms: 1_000,
            retry_attempts: 2,
            retention_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectRetrySettings {
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for DirectRetrySettings {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationSettings {
    pub allowed_extensions: Vec<String>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["jpeg".to_string(), "png".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Queue,
    Direct,
}

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub subscriber: String,
    pub binding: Binding,
    pub predicates: Vec<Predicate>,
}

impl RouteSpec {
    pub fn new(subscriber: &str, binding: Binding, predicates: Vec<Predicate>) -> Self {
        Self {
            subscriber: subscriber.to_string(),
            binding,
            predicates,
        }
    }
}

/// The stock topology.
pub fn default_routes() -> Vec<RouteSpec> {
    vec![
        RouteSpec::new(
            "ingest",
            Binding::Queue,
            vec![Predicate::prefix(ChangeKind::Created.prefix())],
        ),
        RouteSpec::new(
            "confirmation",
            Binding::Direct,
            vec![Predicate::prefix(ChangeKind::Created.prefix())],
        ),
        RouteSpec::new(
            "removal",
            Binding::Direct,
            vec![Predicate::prefix(ChangeKind::Removed.prefix())],
        ),
        RouteSpec::new(
            "description",
            Binding::Queue,
            vec![Predicate::attribute_in(COMMENT_TYPE_ATTRIBUTE, ["Caption"])],
        ),
    ]
}

impl PipelineSettings {
    /// Read and validate a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.message().to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("queue.batch_size", self.queue.batch_size),
            ("queue.workers", self.queue.workers),
            ("dead_letter.batch_size", self.dead_letter.batch_size),
            ("dead_letter.max_concurrency", self.dead_letter.max_concurrency),
            ("inbound.batch_size", self.inbound.batch_size),
            ("inbound.workers", self.inbound.workers),
            ("stream.batch_size", self.stream.batch_size),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{field} must be greater than zero")));
            }
        }
        if self.validation.allowed_extensions.is_empty() {
            return Err(Error::Config(
                "validation.allowed_extensions must not be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for route in &self.routes {
            if !SUBSCRIBERS.contains(&route.subscriber.as_str()) {
                return Err(Error::Config(format!(
                    "unknown subscriber {:?}, expected one of {}",
                    route.subscriber,
                    SUBSCRIBERS.join(", ")
                )));
            }
            if route.predicates.is_empty() {
                return Err(Error::Config(format!(
                    "route for {} has no predicates",
                    route.subscriber
                )));
            }
            if !seen.insert(route.subscriber.as_str()) {
                return Err(Error::Config(format!(
                    "subscriber {} is routed more than once",
                    route.subscriber
                )));
            }
        }
        Ok(())
    }

    /// Configured routes, or the stock topology when none are given.
    pub fn effective_routes(&self) -> Vec<RouteSpec> {
        if self.routes.is_empty() {
            default_routes()
        } else {
            self.routes.clone()
        }
    }

    pub fn allowlist(&self) -> ExtensionAllowlist {
        ExtensionAllowlist::new(&self.validation.allowed_extensions)
    }

    pub fn direct_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.direct_retry.retries,
            Backoff::Fixed {
                delay_ms: self.direct_retry.backoff_ms,
            },
        )
    }

    pub fn work_queue_config(&self) -> QueueConfig {
        let q = &self.queue;
        QueueConfig {
            visibility_timeout: Duration::from_secs(q.visibility_timeout_secs),
            delivery_delay: Duration::from_secs(q.delivery_delay_secs),
            max_batching_window: Duration::from_secs(q.batching_window_secs),
            retention: None,
            retry: RetryPolicy::new(
                q.max_receive_count,
                Backoff::Fixed {
                    delay_ms: q.retry_backoff_ms,
                },
            ),
        }
    }

    pub fn work_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.queue.batch_size,
            receive_wait: Duration::from_secs(self.queue.receive_wait_secs),
            workers: self.queue.workers,
            max_concurrency: None,
        }
    }

    /// The dead-letter queue never dead-letters further: the rejection
    /// consumer always succeeds, and expired entries are purged.
    pub fn dead_letter_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_batching_window: Duration::from_secs(self.dead_letter.batching_window_secs),
            retention: Some(Duration::from_secs(self.dead_letter.retention_secs)),
            retry: RetryPolicy::new(u32::MAX, Backoff::Fixed { delay_ms: 0 }),
            ..QueueConfig::default()
        }
    }

    pub fn dead_letter_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.dead_letter.batch_size,
            receive_wait: Duration::from_secs(self.dead_letter.receive_wait_secs),
            workers: self.dead_letter.max_concurrency,
            max_concurrency: Some(self.dead_letter.max_concurrency),
        }
    }

    pub fn inbound_queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: Duration::from_secs(self.inbound.visibility_timeout_secs),
            retry: RetryPolicy::new(u32::MAX, Backoff::Fixed { delay_ms: 1_000 }),
            ..QueueConfig::default()
        }
    }

    pub fn inbound_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.inbound.batch_size,
            receive_wait: Duration::from_secs(self.inbound.receive_wait_secs),
            workers: self.inbound.workers,
            max_concurrency: None,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            batch_size: self.stream.batch_size,
            start: self.stream.start,
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            retry_attempts: self.stream.retry_attempts,
            retention: (self.stream.retention_secs > 0)
                .then(|| Duration::from_secs(self.stream.retention_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_stock_defaults() {
        let settings = PipelineSettings::from_toml("").unwrap();
        assert_eq!(settings.queue.batch_size, 5);
        assert_eq!(settings.queue.max_receive_count, 1);
        assert_eq!(settings.dead_letter.max_concurrency, 2);
        assert_eq!(settings.stream.start, StreamPosition::TrimHorizon);
        assert_eq!(settings.effective_routes(), default_routes());
        assert_eq!(settings.direct_retry_policy().max_attempts(), 3);
    }

    #[test]
    fn stream_start_accepts_an_explicit_sequence() {
        let settings = PipelineSettings::from_toml(
            r#"
            [stream]
            start = { after = 42 }
            "#,
        )
        .unwrap();
        assert_eq!(settings.stream.start, StreamPosition::After(42));
    }

    #[test]
    fn zero_stream_retention_keeps_changes_forever() {
        let stock = PipelineSettings::default().stream_config();
        assert_eq!(stock.retention, Some(Duration::from_secs(86_400)));

        let settings = PipelineSettings::from_toml("[stream]\nretention_secs = 0").unwrap();
        assert_eq!(settings.stream_config().retention, None);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = PipelineSettings::from_toml("[queue]\nbatch_size = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
