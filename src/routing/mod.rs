//! Fan-out notification router.
//!
//! A routing table maps subscriber ids to filter predicates and a delivery
//! binding. Every subscription whose predicates all match receives the
//! envelope; a subscription with no predicates never matches. Deliveries are
//! independent: one subscriber failing does not stop the others.

pub mod predicate;

use std::collections::BTreeSet;
use std::sync::Arc;

use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, warn};

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::model::Envelope;
use crate::queue::{RetryPolicy, WorkQueue};
use crate::telemetry::delivery::{record_result, start_consume_span};
use crate::telemetry::metrics;

pub use predicate::Predicate;

/// Where a matched envelope goes.
#[derive(Clone)]
pub enum Delivery {
    /// Durable: enqueue and let a queue worker pick it up.
    Queue(Arc<dyn WorkQueue>),
    /// Invoke the consumer in-process, retried per the router's policy.
    Direct(Arc<dyn Consumer>),
}

impl Delivery {
    fn label(&self) -> &'static str {
        match self {
            Delivery::Queue(_) => "queue",
            Delivery::Direct(_) => "direct",
        }
    }
}

pub struct Subscription {
    pub id: String,
    pub filter: Vec<Predicate>,
    pub delivery: Delivery,
}

impl Subscription {
    pub fn new(id: impl Into<String>, filter: Vec<Predicate>, delivery: Delivery) -> Self {
        Self {
            id: id.into(),
            filter,
            delivery,
        }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        !self.filter.is_empty() && self.filter.iter().all(|p| p.matches(envelope))
    }
}

/// What happened to one published envelope.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub matched: BTreeSet<String>,
    pub delivered: BTreeSet<String>,
    pub failed: Vec<(String, Error)>,
    /// Failed enqueues. Direct failures already went through their retries.
    pub failed_enqueues: usize,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Router {
    subscriptions: Vec<Subscription>,
    direct_retry: RetryPolicy,
}

impl Router {
    pub fn new(direct_retry: RetryPolicy) -> Self {
        Self {
            subscriptions: Vec::new(),
            direct_retry,
        }
    }

    /// Add a subscription. Ids are unique and a subscription must filter
    /// on something.
    pub fn subscribe(&mut self, subscription: Subscription) -> Result<()> {
        if subscription.filter.is_empty() {
            return Err(Error::Config(format!(
                "subscription {} has no predicates",
                subscription.id
            )));
        }
        if self.subscriptions.iter().any(|s| s.id == subscription.id) {
            return Err(Error::Config(format!(
                "duplicate subscription {}",
                subscription.id
            )));
        }
        self.subscriptions.push(subscription);
        Ok(())
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    /// Subscribers that would receive `envelope`. No side effects.
    pub fn route(&self, envelope: &Envelope) -> BTreeSet<String> {
        self.subscriptions
            .iter()
            .filter(|s| s.matches(envelope))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Deliver `envelope` to every matching subscriber.
    ///
    /// Queue-bound subscribers are enqueued in order; direct subscribers run
    /// concurrently. Returns once every delivery has finished or given up.
    pub async fn publish(&self, envelope: &Envelope) -> PublishReport {
        let mut report = PublishReport::default();
        let mut direct: JoinSet<(String, Result<()>)> = JoinSet::new();
        // Direct subscribers whose task has not reported back.
        let mut outstanding = BTreeSet::new();

        for subscription in self.subscriptions.iter().filter(|s| s.matches(envelope)) {
            report.matched.insert(subscription.id.clone());
            match &subscription.delivery {
                Delivery::Queue(queue) => {
                    let result = queue.enqueue(envelope).await.map(|msg_id| {
                        debug!(subscriber = %subscription.id, queue = queue.name(), msg_id, "enqueued");
                    });
                    record_delivery(&mut report, subscription, result);
                }
                Delivery::Direct(consumer) => {
                    let id = subscription.id.clone();
                    outstanding.insert(id.clone());
                    let consumer = Arc::clone(consumer);
                    let envelope = envelope.clone();
                    let retry = self.direct_retry;
                    direct.spawn(async move {
                        let result = invoke_direct(consumer.as_ref(), &envelope, retry).await;
                        (id, result)
                    });
                }
            }
        }

        while let Some(joined) = direct.join_next().await {
            match joined {
                Ok((id, result)) => {
                    outstanding.remove(&id);
                    if let Some(subscription) = self.subscriptions.iter().find(|s| s.id == id) {
                        record_delivery(&mut report, subscription, result);
                    }
                }
                Err(e) => error!(error = %e, "direct delivery task panicked"),
            }
        }
        for id in outstanding {
            if let Some(subscription) = self.subscriptions.iter().find(|s| s.id == id) {
                let error = Error::Other(format!("delivery to {id} panicked"));
                record_delivery(&mut report, subscription, Err(error));
            }
        }

        if report.matched.is_empty() {
            debug!(event_name = %envelope.event_name, "no subscriber matched");
        }
        metrics::envelopes_routed().add(
            1,
            &[
                KeyValue::new("event_name", envelope.event_name.clone()),
                KeyValue::new("matched", report.matched.len().to_string()),
            ],
        );
        report
    }
}

fn record_delivery(report: &mut PublishReport, subscription: &Subscription, result: Result<()>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::deliveries().add(
        1,
        &[
            KeyValue::new("subscriber", subscription.id.clone()),
            KeyValue::new("binding", subscription.delivery.label()),
            KeyValue::new("result", outcome),
        ],
    );
    match result {
        Ok(()) => {
            report.delivered.insert(subscription.id.clone());
        }
        Err(e) => {
            error!(subscriber = %subscription.id, error = %e, "delivery failed");
            if matches!(subscription.delivery, Delivery::Queue(_)) {
                report.failed_enqueues += 1;
            }
            report.failed.push((subscription.id.clone(), e));
        }
    }
}

/// At-least-once direct invocation: retry until the policy is exhausted.
async fn invoke_direct(consumer: &dyn Consumer, envelope: &Envelope, retry: RetryPolicy) -> Result<()> {
    let mut attempt = 1;
    loop {
        let span = start_consume_span(consumer.name(), &envelope.id, attempt);
        let result = consumer.handle(envelope).instrument(span.clone()).await;
        record_result(&span, consumer.name(), &result);

        match result {
            Ok(()) => return Ok(()),
            Err(e) if retry.is_exhausted(attempt) => return Err(e),
            Err(e) => {
                warn!(
                    consumer = consumer.name(),
                    attempt,
                    terminal = e.is_terminal(),
                    error = %e,
                    "direct invocation failed, retrying"
                );
                tokio::time::sleep(retry.redelivery_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
