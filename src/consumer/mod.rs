//! Stateless consumers.
//!
//! Each consumer handles one envelope (or one batch of store changes) and
//! either succeeds or fails fast. None of them loop on failure: queue
//! redelivery, direct-invoke retries and stream bisection are the callers'
//! job.

pub mod confirmation;
pub mod dead_letter;
pub mod decode;
pub mod deletion_stream;
pub mod description;
pub mod ingest;
pub mod removal;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Envelope;
use crate::store::ChangeRecord;

pub use confirmation::ConfirmationConsumer;
pub use dead_letter::DeadLetterConsumer;
pub use decode::{ExtensionAllowlist, decode_item_id};
pub use deletion_stream::DeletionStreamConsumer;
pub use description::DescriptionConsumer;
pub use ingest::IngestConsumer;
pub use removal::RemovalConsumer;

/// Handles envelopes delivered by a queue worker or by direct invocation.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

/// Handles batches read from the record store's change stream.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_changes(&self, changes: &[ChangeRecord]) -> Result<()>;
}
