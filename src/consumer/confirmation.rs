//! Confirmation: tell the user their upload arrived.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Consumer, decode_item_id};
use crate::error::{Error, Result};
use crate::model::{ChangeKind, Envelope, NotificationRequest, Template};
use crate::notifier::{Notifier, notify_logged};

pub struct ConfirmationConsumer {
    notifier: Arc<dyn Notifier>,
}

impl ConfirmationConsumer {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Consumer for ConfirmationConsumer {
    fn name(&self) -> &str {
        "confirmation"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event = envelope
            .change()
            .filter(|c| c.kind == ChangeKind::Created)
            .ok_or_else(|| {
                Error::Validation(format!("confirmation cannot handle {}", envelope.event_name))
            })?;
        let item_id = decode_item_id(&event.item_id)?;

        let request =
            NotificationRequest::new(Template::Confirmation, item_id).container(&event.container_id);
        notify_logged(self.notifier.as_ref(), &request).await;
        Ok(())
    }
}
