//! Inbound event feed: envelopes drained from a queue are published into
//! the router.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::model::Envelope;
use crate::routing::Router;

pub struct RouterFeed {
    router: Arc<Router>,
}

impl RouterFeed {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Consumer for RouterFeed {
    fn name(&self) -> &str {
        "inbound"
    }

    /// Publish the envelope. It is kept for redelivery only when a durable
    /// enqueue failed; failed direct deliveries have had their retries.
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let report = self.router.publish(envelope).await;
        debug!(
            event_name = %envelope.event_name,
            matched = report.matched.len(),
            delivered = report.delivered.len(),
            "inbound envelope published"
        );
        if report.failed_enqueues > 0 {
            return Err(Error::Queue(format!(
                "{} of {} subscribers could not be enqueued",
                report.failed_enqueues,
                report.matched.len()
            )));
        }
        Ok(())
    }
}
