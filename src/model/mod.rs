//! Core data model.
//!
//! Raw events come from the storage system (object created/removed) or from
//! an external annotator. The router only ever sees them wrapped in an
//! [`Envelope`], which carries the name and attributes that filters match on.

pub mod item;
pub mod notification;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use item::{ItemFields, ItemRecord};
pub use notification::{NotificationRequest, Template};

/// Attribute carried by annotation envelopes; the description route filters on it.
pub const COMMENT_TYPE_ATTRIBUTE: &str = "comment_type";

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// What happened to the object in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Removed,
}

impl ChangeKind {
    /// Event-name prefix used for routing, e.g. `"Created:"`.
    pub fn prefix(self) -> &'static str {
        match self {
            ChangeKind::Created => "Created:",
            ChangeKind::Removed => "Removed:",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Created => "Created",
            ChangeKind::Removed => "Removed",
        };
        write!(f, "{s}")
    }
}

/// An object-level change reported by the storage system.
///
/// `item_id` is transmitted in its encoded form (`+` for spaces, percent
/// escapes) and must be decoded before it touches the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub item_id: String,
    pub container_id: String,
}

impl ChangeEvent {
    pub fn created(item_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Created,
            item_id: item_id.into(),
            container_id: container_id.into(),
        }
    }

    pub fn removed(item_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            item_id: item_id.into(),
            container_id: container_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Annotation events
// ---------------------------------------------------------------------------

/// The only annotatable field today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationField {
    Description,
}

/// A field update sent by an external actor. No ordering relative to
/// change events is guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationEvent {
    pub item_id: String,
    pub field: AnnotationField,
    pub value: String,
}

impl AnnotationEvent {
    pub fn description(item_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            field: AnnotationField::Description,
            value: value.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Change(ChangeEvent),
    Annotation(AnnotationEvent),
}

/// Routable wrapper around one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    /// Prefix-matchable name, e.g. `"Created:Put"` or `"Removed:ObjectRemoved"`.
    pub event_name: String,
    pub body: EventBody,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event_name: impl Into<String>, body: EventBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_name: event_name.into(),
            body,
            attributes: BTreeMap::new(),
            published_at: Utc::now(),
        }
    }

    /// Wrap a change event; `action` is the storage system's own verb
    /// (`"Put"`, `"ObjectRemoved"`, ...).
    pub fn for_change(event: ChangeEvent, action: &str) -> Self {
        let name = format!("{}{action}", event.kind.prefix());
        Self::new(name, EventBody::Change(event))
    }

    /// Wrap an annotation, tagging it with its comment type.
    pub fn for_annotation(event: AnnotationEvent, comment_type: &str) -> Self {
        Self::new(format!("Annotated:{comment_type}"), EventBody::Annotation(event))
            .with_attribute(COMMENT_TYPE_ATTRIBUTE, comment_type)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn change(&self) -> Option<&ChangeEvent> {
        match &self.body {
            EventBody::Change(event) => Some(event),
            EventBody::Annotation(_) => None,
        }
    }

    pub fn annotation(&self) -> Option<&AnnotationEvent> {
        match &self.body {
            EventBody::Annotation(event) => Some(event),
            EventBody::Change(_) => None,
        }
    }

    /// The item this envelope is about, as transmitted (not decoded).
    pub fn raw_item_id(&self) -> &str {
        match &self.body {
            EventBody::Change(event) => &event.item_id,
            EventBody::Annotation(event) => &event.item_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_envelope_name_carries_kind_prefix() {
        let env = Envelope::for_change(ChangeEvent::removed("a.png", "photos"), "ObjectRemoved");
        assert_eq!(env.event_name, "Removed:ObjectRemoved");
        assert_eq!(env.change().map(|c| c.kind), Some(ChangeKind::Removed));
    }

    #[test]
    fn annotation_envelope_is_tagged_with_comment_type() {
        let env = Envelope::for_annotation(AnnotationEvent::description("a.png", "sunset"), "Caption");
        assert_eq!(env.attribute(COMMENT_TYPE_ATTRIBUTE), Some("Caption"));
        assert!(env.change().is_none());
    }

    #[test]
    fn envelope_json_uses_tagged_body() {
        let env = Envelope::for_change(ChangeEvent::created("a.png", "photos"), "Put");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["body"]["type"], "change");
        assert_eq!(json["body"]["kind"], "created");
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }
}
