//! In-process record store with an append-only change log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ChangeRecord, ChangeStream, Operation, RecordStore};
use crate::error::{Error, Result};
use crate::model::{ItemFields, ItemRecord};

#[derive(Default)]
struct StoreState {
    items: HashMap<String, ItemRecord>,
    changes: VecDeque<ChangeRecord>,
    /// Last sequence handed out. Survives trimming.
    last_sequence: u64,
}

impl StoreState {
    fn append(&mut self, operation: Operation, before: Option<ItemRecord>, after: Option<ItemRecord>) {
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.changes.push_back(ChangeRecord {
            sequence,
            operation,
            before,
            after,
            recorded_at: Utc::now(),
        });
    }
}

/// Record store kept in memory. Records and changes share one lock so the
/// change log order always matches the mutation order.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn upsert(&self, item_id: &str, fields: ItemFields) -> Result<ItemRecord> {
        let now = Utc::now();
        let mut state = self.state();
        let before = state.items.get(item_id).cloned();
        let record = ItemRecord {
            item_id: item_id.to_string(),
            description: fields.description,
            created_at: before.as_ref().map_or(now, |b| b.created_at),
            updated_at: now,
        };
        state.items.insert(item_id.to_string(), record.clone());
        let operation = if before.is_some() {
            Operation::Update
        } else {
            Operation::Insert
        };
        state.append(operation, before, Some(record.clone()));
        Ok(record)
    }

    async fn get(&self, item_id: &str) -> Result<Option<ItemRecord>> {
        Ok(self.state().items.get(item_id).cloned())
    }

    async fn delete(&self, item_id: &str) -> Result<Option<ItemRecord>> {
        let mut state = self.state();
        let removed = state.items.remove(item_id);
        if let Some(ref before) = removed {
            state.append(Operation::Remove, Some(before.clone()), None);
        }
        Ok(removed)
    }

    async fn set_description(&self, item_id: &str, description: &str) -> Result<ItemRecord> {
        let mut state = self.state();
        let Some(current) = state.items.get_mut(item_id) else {
            return Err(Error::NotFound(item_id.to_string()));
        };
        let before = current.clone();
        current.description = Some(description.to_string());
        current.updated_at = Utc::now();
        let after = current.clone();
        state.append(Operation::Update, Some(before), Some(after.clone()));
        Ok(after)
    }
}

#[async_trait]
impl ChangeStream for InMemoryStore {
    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let state = self.state();
        let start = state.changes.partition_point(|c| c.sequence <= after);
        Ok(state.changes.range(start..).take(limit).cloned().collect())
    }

    async fn latest_sequence(&self) -> Result<u64> {
        Ok(self.state().last_sequence)
    }

    async fn trim(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.changes.len();
        state.changes.retain(|c| c.recorded_at >= horizon);
        Ok((before - state.changes.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StreamPosition;

    #[tokio::test]
    async fn upsert_is_create_or_replace() {
        let store = InMemoryStore::new();
        store.upsert("a.png", ItemFields::with_description("one")).await.unwrap();
        store.upsert("a.png", ItemFields::with_description("two")).await.unwrap();

        assert_eq!(store.len(), 1);
        let record = store.get("a.png").await.unwrap().unwrap();
        assert_eq!(record.description.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn change_log_records_each_mutation_in_order() {
        let store = InMemoryStore::new();
        store.upsert("a.png", ItemFields::default()).await.unwrap();
        store.set_description("a.png", "hi").await.unwrap();
        store.delete("a.png").await.unwrap();
        store.delete("a.png").await.unwrap();

        let changes = store.read_after(0, 10).await.unwrap();
        let ops: Vec<_> = changes.iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Remove]);
        assert_eq!(
            changes[2].before.as_ref().and_then(|b| b.description.as_deref()),
            Some("hi")
        );
    }

    #[tokio::test]
    async fn read_after_respects_cursor_and_limit() {
        let store = InMemoryStore::new();
        for name in ["a.png", "b.png", "c.png"] {
            store.upsert(name, ItemFields::default()).await.unwrap();
        }
        let page = store.read_after(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sequence, 2);

        assert_eq!(store.resolve(StreamPosition::Latest).await.unwrap(), 3);
        assert_eq!(store.resolve(StreamPosition::TrimHorizon).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_drops_old_changes_but_keeps_numbering() {
        let store = InMemoryStore::new();
        store.upsert("a.png", ItemFields::default()).await.unwrap();
        store.delete("a.png").await.unwrap();

        let horizon = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.trim(horizon).await.unwrap(), 2);
        assert_eq!(store.trim(horizon).await.unwrap(), 0);
        assert!(store.read_after(0, 10).await.unwrap().is_empty());
        assert_eq!(store.resolve(StreamPosition::Latest).await.unwrap(), 2);

        store.upsert("b.png", ItemFields::default()).await.unwrap();
        let changes = store.read_after(0, 10).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].sequence, 3);
    }

    #[tokio::test]
    async fn trim_keeps_changes_inside_the_horizon() {
        let store = InMemoryStore::new();
        store.upsert("a.png", ItemFields::default()).await.unwrap();

        let horizon = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.trim(horizon).await.unwrap(), 0);
        assert_eq!(store.read_after(0, 10).await.unwrap().len(), 1);
    }
}
