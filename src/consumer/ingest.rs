//! Ingest: record newly created items.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Consumer, ExtensionAllowlist, decode_item_id};
use crate::error::{Error, Result};
use crate::model::{ChangeKind, Envelope, ItemFields};
use crate::store::RecordStore;

/// Validates created items and upserts their record.
///
/// An unsupported extension is a `Validation` error. The message is not
/// acked, so it redelivers until the queue dead-letters it and the rejection
/// path tells the user.
pub struct IngestConsumer {
    store: Arc<dyn RecordStore>,
    allowlist: ExtensionAllowlist,
}

impl IngestConsumer {
    pub fn new(store: Arc<dyn RecordStore>, allowlist: ExtensionAllowlist) -> Self {
        Self { store, allowlist }
    }
}

#[async_trait]
impl Consumer for IngestConsumer {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event = envelope
            .change()
            .filter(|c| c.kind == ChangeKind::Created)
            .ok_or_else(|| {
                Error::Validation(format!("ingest cannot handle {}", envelope.event_name))
            })?;

        let item_id = decode_item_id(&event.item_id)?;
        self.allowlist.validate(&item_id)?;

        self.store.upsert(&item_id, ItemFields::default()).await?;
        info!(item = %item_id, container = %event.container_id, "item ingested");
        Ok(())
    }
}
