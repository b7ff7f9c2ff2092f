//! Deletion stream: notify users when a record is deleted.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::ChangeHandler;
use crate::error::Result;
use crate::model::{NotificationRequest, Template};
use crate::notifier::{Notifier, notify_logged};
use crate::store::{ChangeRecord, Operation};

/// How many recent change sequences are remembered for duplicate suppression.
const RECENT_WINDOW: usize = 1024;

/// Sequences already notified, oldest first.
#[derive(Default)]
struct Recent {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl Recent {
    /// Returns false if the sequence was already recorded.
    fn insert(&mut self, sequence: u64) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        self.order.push_back(sequence);
        if self.order.len() > RECENT_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Reads the store's change stream, not the router. Inserts and updates
/// are ignored. A redelivered removal within the recent window is skipped;
/// older duplicates are notified again.
pub struct DeletionStreamConsumer {
    notifier: Arc<dyn Notifier>,
    recent: Mutex<Recent>,
}

impl DeletionStreamConsumer {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            recent: Mutex::new(Recent::default()),
        }
    }

    fn first_sighting(&self, sequence: u64) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sequence)
    }
}

#[async_trait]
impl ChangeHandler for DeletionStreamConsumer {
    fn name(&self) -> &str {
        "deletion_stream"
    }

    async fn handle_changes(&self, changes: &[ChangeRecord]) -> Result<()> {
        for change in changes {
            if change.operation != Operation::Remove {
                continue;
            }
            let Some(ref before) = change.before else {
                debug!(sequence = change.sequence, "removal without prior image");
                continue;
            };
            if !self.first_sighting(change.sequence) {
                debug!(sequence = change.sequence, item = %before.item_id, "duplicate removal");
                continue;
            }
            let request = NotificationRequest::new(Template::Deleted, &before.item_id);
            notify_logged(self.notifier.as_ref(), &request).await;
        }
        Ok(())
    }
}
