//! Integration tests for the consumers, run against the in-memory store and
//! recording notifiers.

use std::sync::Arc;

use async_trait::async_trait;
use bucket_relay::consumer::{
    ChangeHandler, ConfirmationConsumer, Consumer, DeadLetterConsumer, DeletionStreamConsumer,
    DescriptionConsumer, ExtensionAllowlist, IngestConsumer, RemovalConsumer,
};
use bucket_relay::error::{Error, Result};
use bucket_relay::model::{
    AnnotationEvent, ChangeEvent, Envelope, ItemFields, ItemRecord, NotificationRequest, Template,
};
use bucket_relay::notifier::{Notifier, RecordingNotifier};
use bucket_relay::store::{ChangeStream, InMemoryStore, RecordStore};

fn created(item: &str) -> Envelope {
    Envelope::for_change(ChangeEvent::created(item, "photos"), "Put")
}

fn removed(item: &str) -> Envelope {
    Envelope::for_change(ChangeEvent::removed(item, "photos"), "ObjectRemoved")
}

fn caption(item: &str, text: &str) -> Envelope {
    Envelope::for_annotation(AnnotationEvent::description(item, text), "Caption")
}

/// Store whose backend is unreachable.
struct UnreachableStore;

#[async_trait]
impl RecordStore for UnreachableStore {
    async fn upsert(&self, _item_id: &str, _fields: ItemFields) -> Result<ItemRecord> {
        Err(Error::Store("connection refused".into()))
    }

    async fn get(&self, _item_id: &str) -> Result<Option<ItemRecord>> {
        Err(Error::Store("connection refused".into()))
    }

    async fn delete(&self, _item_id: &str) -> Result<Option<ItemRecord>> {
        Err(Error::Store("connection refused".into()))
    }

    async fn set_description(&self, _item_id: &str, _description: &str) -> Result<ItemRecord> {
        Err(Error::Store("connection refused".into()))
    }
}

/// Notifier that always fails.
struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn send(&self, _request: &NotificationRequest) -> Result<()> {
        Err(Error::Notifier("mail relay down".into()))
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingest_decodes_id_and_upserts_record() {
    let store = Arc::new(InMemoryStore::new());
    let ingest = IngestConsumer::new(store.clone(), ExtensionAllowlist::default());

    ingest.handle(&created("my+photo%20(1).png")).await.unwrap();

    let record = store.get("my photo (1).png").await.unwrap().unwrap();
    assert_eq!(record.item_id, "my photo (1).png");
    assert_eq!(record.description, None);
}

#[tokio::test]
async fn ingest_rejects_unsupported_extension_without_writing() {
    let store = Arc::new(InMemoryStore::new());
    let ingest = IngestConsumer::new(store.clone(), ExtensionAllowlist::default());

    let err = ingest.handle(&created("x.exe")).await.unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(err.is_terminal());
    assert!(store.is_empty());
}

#[tokio::test]
async fn ingest_twice_leaves_one_record() {
    let store = Arc::new(InMemoryStore::new());
    let ingest = IngestConsumer::new(store.clone(), ExtensionAllowlist::default());
    let env = created("a.jpeg");

    ingest.handle(&env).await.unwrap();
    ingest.handle(&env).await.unwrap();

    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn ingest_refuses_removal_events() {
    let store = Arc::new(InMemoryStore::new());
    let ingest = IngestConsumer::new(store.clone(), ExtensionAllowlist::default());

    let err = ingest.handle(&removed("a.png")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn ingest_surfaces_store_outage_as_transient() {
    let ingest = IngestConsumer::new(Arc::new(UnreachableStore), ExtensionAllowlist::default());

    let err = ingest.handle(&created("a.png")).await.unwrap_err();

    assert!(matches!(err, Error::Store(_)));
    assert!(!err.is_terminal());
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removal_deletes_existing_record() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert("old photo.png", ItemFields::default()).await.unwrap();
    let removal = RemovalConsumer::new(store.clone(), ExtensionAllowlist::default());

    removal.handle(&removed("old+photo.png")).await.unwrap();

    assert!(store.get("old photo.png").await.unwrap().is_none());
}

#[tokio::test]
async fn removal_of_absent_record_is_a_no_op() {
    let store = Arc::new(InMemoryStore::new());
    let removal = RemovalConsumer::new(store.clone(), ExtensionAllowlist::default());

    removal.handle(&removed("never-seen.png")).await.unwrap();
    removal.handle(&removed("never-seen.png")).await.unwrap();

    assert!(store.is_empty());
}

#[tokio::test]
async fn removal_skips_unsupported_extensions() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert("notes.txt", ItemFields::default()).await.unwrap();
    let removal = RemovalConsumer::new(store.clone(), ExtensionAllowlist::default());

    removal.handle(&removed("notes.txt")).await.unwrap();

    assert!(store.get("notes.txt").await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Description
// ---------------------------------------------------------------------------

#[tokio::test]
async fn description_updates_existing_record() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert("a.png", ItemFields::default()).await.unwrap();
    let description = DescriptionConsumer::new(store.clone());

    description.handle(&caption("a.png", "sunset")).await.unwrap();

    let record = store.get("a.png").await.unwrap().unwrap();
    assert_eq!(record.description.as_deref(), Some("sunset"));
}

#[tokio::test]
async fn description_trims_item_id() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert("a.png", ItemFields::default()).await.unwrap();
    let description = DescriptionConsumer::new(store.clone());

    description.handle(&caption("  a.png \n", "beach")).await.unwrap();

    let record = store.get("a.png").await.unwrap().unwrap();
    assert_eq!(record.description.as_deref(), Some("beach"));
}

#[tokio::test]
async fn description_on_missing_item_is_not_found_and_creates_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let description = DescriptionConsumer::new(store.clone());

    let err = description.handle(&caption("ghost.png", "boo")).await.unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
    assert!(store.is_empty());
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmation_names_item_and_container() {
    let notifier = Arc::new(RecordingNotifier::new());
    let confirmation = ConfirmationConsumer::new(notifier.clone());

    confirmation.handle(&created("a.png")).await.unwrap();

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, Template::Confirmation);
    assert_eq!(sent[0].item_id, "a.png");
    assert_eq!(sent[0].container_id.as_deref(), Some("photos"));
}

#[tokio::test]
async fn notifier_failure_never_fails_the_consumer() {
    let confirmation = ConfirmationConsumer::new(Arc::new(BrokenNotifier));
    confirmation.handle(&created("a.png")).await.unwrap();

    let dead_letter = DeadLetterConsumer::new(Arc::new(BrokenNotifier));
    dead_letter.handle(&created("x.exe")).await.unwrap();
}

#[tokio::test]
async fn dead_letter_sends_rejection_with_decoded_id() {
    let notifier = Arc::new(RecordingNotifier::new());
    let dead_letter = DeadLetterConsumer::new(notifier.clone());

    dead_letter.handle(&created("bad+file.exe")).await.unwrap();

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, Template::Rejection);
    assert_eq!(sent[0].item_id, "bad file.exe");
    assert!(sent[0].message().contains("s3://photos/bad file.exe"));
}

// ---------------------------------------------------------------------------
// Deletion stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deletion_stream_notifies_once_per_deletion() {
    let store = InMemoryStore::new();
    store.upsert("p.png", ItemFields::default()).await.unwrap();
    store.delete("p.png").await.unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let handler = DeletionStreamConsumer::new(notifier.clone());

    let changes = store.read_after(0, 100).await.unwrap();
    handler.handle_changes(&changes).await.unwrap();
    // The stream redelivers the same batch.
    handler.handle_changes(&changes).await.unwrap();

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, Template::Deleted);
    assert_eq!(sent[0].item_id, "p.png");
}

#[tokio::test]
async fn deletion_stream_ignores_inserts_and_updates() {
    let store = InMemoryStore::new();
    store.upsert("a.png", ItemFields::default()).await.unwrap();
    store.set_description("a.png", "sunset").await.unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let handler = DeletionStreamConsumer::new(notifier.clone());

    let changes = store.read_after(0, 100).await.unwrap();
    assert_eq!(changes.len(), 2);
    handler.handle_changes(&changes).await.unwrap();

    assert!(notifier.sent().is_empty());
}
