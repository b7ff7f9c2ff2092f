//! Description: apply caption annotations to existing records.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::Consumer;
use crate::error::{Error, Result};
use crate::model::{AnnotationField, Envelope};
use crate::store::RecordStore;

/// Sets the description of an already-ingested item.
///
/// A missing item is `NotFound`; the record is never created here.
pub struct DescriptionConsumer {
    store: Arc<dyn RecordStore>,
}

impl DescriptionConsumer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Consumer for DescriptionConsumer {
    fn name(&self) -> &str {
        "description"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event = envelope.annotation().ok_or_else(|| {
            Error::Validation(format!("description cannot handle {}", envelope.event_name))
        })?;
        // Senders pad names with stray whitespace.
        let item_id = event.item_id.trim();

        if self.store.get(item_id).await?.is_none() {
            return Err(Error::NotFound(item_id.to_string()));
        }
        match event.field {
            AnnotationField::Description => {
                self.store.set_description(item_id, &event.value).await?;
            }
        }
        info!(item = %item_id, "description updated");
        Ok(())
    }
}
