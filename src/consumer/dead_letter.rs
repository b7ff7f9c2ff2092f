//! Dead-letter: tell the user an item could not be processed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Consumer, decode_item_id};
use crate::error::Result;
use crate::model::{Envelope, EventBody, NotificationRequest, Template};
use crate::notifier::{Notifier, notify_logged};
use crate::queue::DEAD_LETTER_SOURCE_ATTRIBUTE;

/// Turns every dead-lettered envelope into a rejection notice. Never fails,
/// so the dead-letter queue itself never redelivers.
pub struct DeadLetterConsumer {
    notifier: Arc<dyn Notifier>,
}

impl DeadLetterConsumer {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    fn rejection_for(envelope: &Envelope) -> NotificationRequest {
        match &envelope.body {
            EventBody::Change(event) => {
                let item_id = decode_item_id(&event.item_id).unwrap_or_else(|e| {
                    warn!(raw = %event.item_id, error = %e, "using undecoded item id");
                    event.item_id.clone()
                });
                NotificationRequest::new(Template::Rejection, item_id).container(&event.container_id)
            }
            EventBody::Annotation(event) => {
                NotificationRequest::new(Template::Rejection, event.item_id.trim())
            }
        }
    }
}

#[async_trait]
impl Consumer for DeadLetterConsumer {
    fn name(&self) -> &str {
        "dead_letter"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let request = Self::rejection_for(envelope);
        info!(
            item = %request.item_id,
            source = envelope.attribute(DEAD_LETTER_SOURCE_ATTRIBUTE).unwrap_or("unknown"),
            "rejecting dead-lettered item"
        );
        notify_logged(self.notifier.as_ref(), &request).await;
        Ok(())
    }
}
