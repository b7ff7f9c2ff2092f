//! Removal: drop the record of an item that left the bucket.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Consumer, ExtensionAllowlist, decode_item_id};
use crate::error::{Error, Result};
use crate::model::{ChangeKind, Envelope};
use crate::store::RecordStore;

pub struct RemovalConsumer {
    store: Arc<dyn RecordStore>,
    allowlist: ExtensionAllowlist,
}

impl RemovalConsumer {
    pub fn new(store: Arc<dyn RecordStore>, allowlist: ExtensionAllowlist) -> Self {
        Self { store, allowlist }
    }
}

#[async_trait]
impl Consumer for RemovalConsumer {
    fn name(&self) -> &str {
        "removal"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event = envelope
            .change()
            .filter(|c| c.kind == ChangeKind::Removed)
            .ok_or_else(|| {
                Error::Validation(format!("removal cannot handle {}", envelope.event_name))
            })?;

        let item_id = decode_item_id(&event.item_id)?;
        // Unsupported items were never ingested, so there is nothing to delete.
        if !self.allowlist.allows(&item_id) {
            debug!(item = %item_id, "unsupported extension, nothing to remove");
            return Ok(());
        }

        match self.store.delete(&item_id).await? {
            Some(_) => info!(item = %item_id, "item record removed"),
            None => debug!(item = %item_id, "no record to remove"),
        }
        Ok(())
    }
}
