//! Integration tests for the fan-out router.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bucket_relay::consumer::Consumer;
use bucket_relay::error::{Error, Result};
use bucket_relay::model::{AnnotationEvent, COMMENT_TYPE_ATTRIBUTE, ChangeEvent, Envelope};
use bucket_relay::queue::{Backoff, InMemoryQueue, QueueConfig, RetryPolicy, WorkQueue};
use bucket_relay::routing::{Delivery, Predicate, Router, Subscription};

/// Fails its first `failures` calls, then succeeds.
struct Flaky {
    name: &'static str,
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(name: &'static str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for Flaky {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(Error::Store(format!("{} unavailable", self.name)));
        }
        Ok(())
    }
}

fn created(item: &str) -> Envelope {
    Envelope::for_change(ChangeEvent::created(item, "photos"), "Put")
}

fn removed(item: &str) -> Envelope {
    Envelope::for_change(ChangeEvent::removed(item, "photos"), "ObjectRemoved")
}

fn annotated(comment_type: &str) -> Envelope {
    Envelope::for_annotation(AnnotationEvent::description("a.png", "sunset"), comment_type)
}

struct Topology {
    router: Router,
    ingest_queue: Arc<InMemoryQueue>,
    confirmation: Arc<Flaky>,
    removal: Arc<Flaky>,
    description: Arc<Flaky>,
}

/// The stock topology with fake direct consumers.
fn topology(retry: RetryPolicy) -> Topology {
    let ingest_queue = Arc::new(InMemoryQueue::new("ingest_work", QueueConfig::default()));
    let confirmation = Flaky::new("confirmation", 0);
    let removal = Flaky::new("removal", 0);
    let description = Flaky::new("description", 0);

    let mut router = Router::new(retry);
    router
        .subscribe(Subscription::new(
            "ingest",
            vec![Predicate::prefix("Created:")],
            Delivery::Queue(ingest_queue.clone()),
        ))
        .unwrap();
    router
        .subscribe(Subscription::new(
            "confirmation",
            vec![Predicate::prefix("Created:")],
            Delivery::Direct(confirmation.clone()),
        ))
        .unwrap();
    router
        .subscribe(Subscription::new(
            "removal",
            vec![Predicate::prefix("Removed:")],
            Delivery::Direct(removal.clone()),
        ))
        .unwrap();
    router
        .subscribe(Subscription::new(
            "description",
            vec![Predicate::attribute_in(COMMENT_TYPE_ATTRIBUTE, ["Caption"])],
            Delivery::Direct(description.clone()),
        ))
        .unwrap();

    Topology {
        router,
        ingest_queue,
        confirmation,
        removal,
        description,
    }
}

fn names(ids: &[&str]) -> std::collections::BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Route evaluation
// ---------------------------------------------------------------------------

#[test]
fn created_fans_out_to_ingest_and_confirmation() {
    let t = topology(RetryPolicy::none());
    assert_eq!(t.router.route(&created("a.png")), names(&["confirmation", "ingest"]));
}

#[test]
fn removed_reaches_only_removal() {
    let t = topology(RetryPolicy::none());
    assert_eq!(t.router.route(&removed("a.png")), names(&["removal"]));
}

#[test]
fn only_caption_annotations_reach_description() {
    let t = topology(RetryPolicy::none());
    assert_eq!(t.router.route(&annotated("Caption")), names(&["description"]));
    assert!(t.router.route(&annotated("Review")).is_empty());
}

#[test]
fn unmatched_event_reaches_nobody() {
    let t = topology(RetryPolicy::none());
    let env = Envelope::new("Restored:Copy", created("a.png").body);
    assert!(t.router.route(&env).is_empty());
}

#[test]
fn subscription_needs_predicates_and_a_unique_id() {
    let mut router = Router::new(RetryPolicy::none());
    let consumer = Flaky::new("c", 0);

    let empty = router.subscribe(Subscription::new("c", vec![], Delivery::Direct(consumer.clone())));
    assert!(matches!(empty, Err(Error::Config(_))));

    router
        .subscribe(Subscription::new(
            "c",
            vec![Predicate::prefix("Created:")],
            Delivery::Direct(consumer.clone()),
        ))
        .unwrap();
    let duplicate = router.subscribe(Subscription::new(
        "c",
        vec![Predicate::prefix("Removed:")],
        Delivery::Direct(consumer),
    ));
    assert!(matches!(duplicate, Err(Error::Config(_))));
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_enqueues_and_invokes_every_match() {
    let t = topology(RetryPolicy::none());

    let report = t.router.publish(&created("a.png")).await;

    assert!(report.is_complete());
    assert_eq!(report.delivered, names(&["confirmation", "ingest"]));
    assert_eq!(t.ingest_queue.stats().await.unwrap().depth, 1);
    assert_eq!(t.confirmation.calls(), 1);
    assert_eq!(t.removal.calls(), 0);
    assert_eq!(t.description.calls(), 0);
}

#[tokio::test]
async fn failing_subscriber_does_not_block_the_others() {
    let queue = Arc::new(InMemoryQueue::new("ingest_work", QueueConfig::default()));
    let broken = Flaky::new("broken", u32::MAX);
    let healthy = Flaky::new("healthy", 0);

    let mut router = Router::new(RetryPolicy::none());
    for (id, delivery) in [
        ("broken", Delivery::Direct(broken.clone())),
        ("healthy", Delivery::Direct(healthy.clone())),
        ("ingest", Delivery::Queue(queue.clone())),
    ] {
        router
            .subscribe(Subscription::new(id, vec![Predicate::prefix("Created:")], delivery))
            .unwrap();
    }

    let report = router.publish(&created("a.png")).await;

    assert!(!report.is_complete());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert_eq!(report.failed_enqueues, 0);
    assert_eq!(report.delivered, names(&["healthy", "ingest"]));
    assert_eq!(healthy.calls(), 1);
    assert_eq!(queue.stats().await.unwrap().depth, 1);
}

#[tokio::test(start_paused = true)]
async fn direct_invocation_is_retried_with_backoff() {
    let retry = RetryPolicy::new(2, Backoff::Fixed { delay_ms: 1_000 });
    let flaky = Flaky::new("removal", 2);
    let mut router = Router::new(retry);
    router
        .subscribe(Subscription::new(
            "removal",
            vec![Predicate::prefix("Removed:")],
            Delivery::Direct(flaky.clone()),
        ))
        .unwrap();
    let start = tokio::time::Instant::now();

    let report = router.publish(&removed("a.png")).await;

    assert!(report.is_complete());
    assert_eq!(flaky.calls(), 3);
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn direct_invocation_gives_up_after_policy_is_exhausted() {
    let retry = RetryPolicy::new(2, Backoff::Fixed { delay_ms: 1_000 });
    let broken = Flaky::new("description", u32::MAX);
    let mut router = Router::new(retry);
    router
        .subscribe(Subscription::new(
            "description",
            vec![Predicate::attribute_in(COMMENT_TYPE_ATTRIBUTE, ["Caption"])],
            Delivery::Direct(broken.clone()),
        ))
        .unwrap();

    let report = router.publish(&annotated("Caption")).await;

    assert_eq!(broken.calls(), 3);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].1, Error::Store(_)));
}

/// Panics on every call.
struct Exploding;

#[async_trait]
impl Consumer for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        panic!("consumer blew up");
    }
}

#[tokio::test]
async fn panicking_direct_subscriber_is_reported_as_failed() {
    let healthy = Flaky::new("healthy", 0);
    let mut router = Router::new(RetryPolicy::none());
    router
        .subscribe(Subscription::new(
            "exploding",
            vec![Predicate::prefix("Created:")],
            Delivery::Direct(Arc::new(Exploding)),
        ))
        .unwrap();
    router
        .subscribe(Subscription::new(
            "healthy",
            vec![Predicate::prefix("Created:")],
            Delivery::Direct(healthy.clone()),
        ))
        .unwrap();

    let report = router.publish(&created("a.png")).await;

    assert!(!report.is_complete());
    assert_eq!(report.delivered, names(&["healthy"]));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "exploding");
    assert!(matches!(report.failed[0].1, Error::Other(_)));
    assert_eq!(report.failed_enqueues, 0);
}
