//! Filter predicates evaluated against an envelope.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// `event_name` starts with `prefix`. A trailing `*` is accepted and ignored,
    /// so `"Created:*"` and `"Created:"` are the same filter.
    Prefix { prefix: String },
    /// The named attribute is present and equal to one of `values`.
    AttributeAllowlist {
        attribute: String,
        values: BTreeSet<String>,
    },
}

impl Predicate {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Predicate::Prefix {
            prefix: prefix.into(),
        }
    }

    pub fn attribute_in<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::AttributeAllowlist {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Predicate::Prefix { prefix } => {
                let prefix = prefix.strip_suffix('*').unwrap_or(prefix);
                envelope.event_name.starts_with(prefix)
            }
            Predicate::AttributeAllowlist { attribute, values } => envelope
                .attribute(attribute)
                .is_some_and(|value| values.contains(value)),
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Prefix { prefix } => write!(f, "prefix({prefix})"),
            Predicate::AttributeAllowlist { attribute, values } => {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "{attribute} in {{{}}}", values.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnnotationEvent, ChangeEvent};

    #[test]
    fn prefix_accepts_glob_suffix() {
        let env = Envelope::for_change(ChangeEvent::created("a.png", "b"), "Put");
        assert!(Predicate::prefix("Created:*").matches(&env));
        assert!(Predicate::prefix("Created:").matches(&env));
        assert!(!Predicate::prefix("Removed:").matches(&env));
    }

    #[test]
    fn attribute_allowlist_requires_presence_and_membership() {
        let caption = Envelope::for_annotation(AnnotationEvent::description("a.png", "x"), "Caption");
        let review = Envelope::for_annotation(AnnotationEvent::description("a.png", "x"), "Review");
        let change = Envelope::for_change(ChangeEvent::created("a.png", "b"), "Put");
        let pred = Predicate::attribute_in("comment_type", ["Caption"]);

        assert!(pred.matches(&caption));
        assert!(!pred.matches(&review));
        assert!(!pred.matches(&change));
    }

    #[test]
    fn predicates_deserialize_from_tagged_toml() {
        let pred: Predicate = toml::from_str(
            r#"
            kind = "attribute_allowlist"
            attribute = "comment_type"
            values = ["Caption"]
            "#,
        )
        .unwrap();
        assert_eq!(pred, Predicate::attribute_in("comment_type", ["Caption"]));
    }
}
