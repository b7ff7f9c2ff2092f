//! Wires stores, queues, consumers and the router into a running service.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Binding, PipelineSettings};
use crate::consumer::{
    ConfirmationConsumer, Consumer, DeadLetterConsumer, DeletionStreamConsumer,
    DescriptionConsumer, IngestConsumer, RemovalConsumer,
};
use crate::error::{Error, Result};
use crate::model::Envelope;
use crate::notifier::Notifier;
use crate::queue::{InMemoryQueue, PgmqQueue, QueueConfig, WorkQueue};
use crate::routing::{Delivery, PublishReport, Router, Subscription};
use crate::store::{ChangeStream, InMemoryStore, PgStore, RecordStore};
use crate::worker::{ChangeStreamPoller, QueueWorker, RouterFeed, WorkerConfig};

pub const INBOUND_QUEUE: &str = "inbound";
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Name of the work queue that feeds a queue-bound subscriber.
pub fn work_queue_name(subscriber: &str) -> String {
    format!("{subscriber}_work")
}

/// Where queues live.
#[derive(Clone)]
pub enum QueueBackend {
    InMemory,
    Postgres(PgPool),
}

/// Creates queues on one backend, all sharing one dead-letter queue.
enum QueueSite {
    InMemory(Arc<InMemoryQueue>),
    Postgres(PgPool),
}

impl QueueSite {
    /// A queue whose exhausted messages go to the dead-letter queue.
    async fn work_queue(&self, name: &str, config: QueueConfig) -> Result<Arc<dyn WorkQueue>> {
        let queue: Arc<dyn WorkQueue> = match self {
            QueueSite::InMemory(dlq) => {
                Arc::new(InMemoryQueue::new(name, config).with_dead_letter(dlq.clone()))
            }
            QueueSite::Postgres(pool) => Arc::new(
                PgmqQueue::create(pool.clone(), name, Some(DEAD_LETTER_QUEUE), config).await?,
            ),
        };
        Ok(queue)
    }

    /// A queue without a dead-letter target.
    async fn plain_queue(&self, name: &str, config: QueueConfig) -> Result<Arc<dyn WorkQueue>> {
        let queue: Arc<dyn WorkQueue> = match self {
            QueueSite::InMemory(_) => Arc::new(InMemoryQueue::new(name, config)),
            QueueSite::Postgres(pool) => {
                Arc::new(PgmqQueue::create(pool.clone(), name, None, config).await?)
            }
        };
        Ok(queue)
    }
}

/// A queue and the consumer its workers feed.
struct WorkBinding {
    queue: Arc<dyn WorkQueue>,
    consumer: Arc<dyn Consumer>,
    config: WorkerConfig,
}

pub struct Pipeline {
    settings: PipelineSettings,
    store: Arc<dyn RecordStore>,
    stream: Arc<dyn ChangeStream>,
    notifier: Arc<dyn Notifier>,
    router: Arc<Router>,
    inbound: Arc<dyn WorkQueue>,
    dead_letter: Arc<dyn WorkQueue>,
    work: Vec<WorkBinding>,
}

impl Pipeline {
    /// Everything in process memory. Nothing survives a restart.
    pub async fn in_memory(settings: PipelineSettings, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        Self::build(settings, store.clone(), store, notifier, QueueBackend::InMemory).await
    }

    /// Postgres record store and pgmq queues on the store's pool.
    pub async fn postgres(
        settings: PipelineSettings,
        store: PgStore,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let pool = store.pool().clone();
        let store = Arc::new(store);
        Self::build(settings, store.clone(), store, notifier, QueueBackend::Postgres(pool)).await
    }

    pub async fn build(
        settings: PipelineSettings,
        store: Arc<dyn RecordStore>,
        stream: Arc<dyn ChangeStream>,
        notifier: Arc<dyn Notifier>,
        backend: QueueBackend,
    ) -> Result<Self> {
        settings.validate()?;

        let (dead_letter, site) = match backend {
            QueueBackend::InMemory => {
                let dlq = Arc::new(InMemoryQueue::new(
                    DEAD_LETTER_QUEUE,
                    settings.dead_letter_queue_config(),
                ));
                let site = QueueSite::InMemory(dlq.clone());
                (dlq as Arc<dyn WorkQueue>, site)
            }
            QueueBackend::Postgres(pool) => {
                let site = QueueSite::Postgres(pool);
                let dlq = site
                    .plain_queue(DEAD_LETTER_QUEUE, settings.dead_letter_queue_config())
                    .await?;
                (dlq, site)
            }
        };
        let inbound = site
            .plain_queue(INBOUND_QUEUE, settings.inbound_queue_config())
            .await?;

        let mut router = Router::new(settings.direct_retry_policy());
        let mut work = Vec::new();
        for route in settings.effective_routes() {
            let consumer = Self::consumer_for(&route.subscriber, &settings, &store, &notifier)?;
            let delivery = match route.binding {
                Binding::Direct => Delivery::Direct(consumer),
                Binding::Queue => {
                    let queue = site
                        .work_queue(&work_queue_name(&route.subscriber), settings.work_queue_config())
                        .await?;
                    work.push(WorkBinding {
                        queue: queue.clone(),
                        consumer,
                        config: settings.work_worker_config(),
                    });
                    Delivery::Queue(queue)
                }
            };
            router.subscribe(Subscription::new(route.subscriber, route.predicates, delivery))?;
        }
        info!(
            subscribers = router.subscriptions().count(),
            work_queues = work.len(),
            "pipeline assembled"
        );

        Ok(Self {
            settings,
            store,
            stream,
            notifier,
            router: Arc::new(router),
            inbound,
            dead_letter,
            work,
        })
    }

    fn consumer_for(
        subscriber: &str,
        settings: &PipelineSettings,
        store: &Arc<dyn RecordStore>,
        notifier: &Arc<dyn Notifier>,
    ) -> Result<Arc<dyn Consumer>> {
        Ok(match subscriber {
            "ingest" => Arc::new(IngestConsumer::new(store.clone(), settings.allowlist())),
            "removal" => Arc::new(RemovalConsumer::new(store.clone(), settings.allowlist())),
            "description" => Arc::new(DescriptionConsumer::new(store.clone())),
            "confirmation" => Arc::new(ConfirmationConsumer::new(notifier.clone())),
            other => return Err(Error::Config(format!("unknown subscriber {other:?}"))),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Route an envelope now, in the caller's task.
    pub async fn publish(&self, envelope: &Envelope) -> PublishReport {
        self.router.publish(envelope).await
    }

    /// Hand an envelope to the inbound queue; a running service routes it.
    pub async fn submit(&self, envelope: &Envelope) -> Result<i64> {
        self.inbound.enqueue(envelope).await
    }

    /// Every queue the pipeline owns: inbound, work queues, dead letters.
    pub fn queues(&self) -> Vec<Arc<dyn WorkQueue>> {
        std::iter::once(self.inbound.clone())
            .chain(self.work.iter().map(|w| w.queue.clone()))
            .chain(std::iter::once(self.dead_letter.clone()))
            .collect()
    }

    /// Start every worker and the change-stream poller. They stop when
    /// `shutdown` is cancelled.
    pub fn spawn(&self, shutdown: &CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        let mut pools = vec![QueueWorker::new(
            self.inbound.clone(),
            Arc::new(RouterFeed::new(self.router.clone())),
            self.settings.inbound_worker_config(),
        )];
        pools.extend(
            self.work
                .iter()
                .map(|w| QueueWorker::new(w.queue.clone(), w.consumer.clone(), w.config.clone())),
        );
        pools.push(QueueWorker::new(
            self.dead_letter.clone(),
            Arc::new(DeadLetterConsumer::new(self.notifier.clone())),
            self.settings.dead_letter_worker_config(),
        ));

        for pool in &pools {
            pool.spawn_pool(&mut tasks, shutdown);
        }

        let poller = ChangeStreamPoller::new(
            self.stream.clone(),
            Arc::new(DeletionStreamConsumer::new(self.notifier.clone())),
            self.settings.stream_config(),
        );
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = poller.run(shutdown).await {
                error!(error = %e, "change stream poller failed");
            }
        });

        tasks
    }

    /// Run until `shutdown` is cancelled and every task has stopped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = self.spawn(&shutdown);
        info!(tasks = tasks.len(), "pipeline running");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "pipeline task panicked");
            }
        }
        info!("pipeline stopped");
        Ok(())
    }
}
