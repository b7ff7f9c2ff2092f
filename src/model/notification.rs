//! User-facing notification requests.

use serde::{Deserialize, Serialize};

/// Formats a rejected item must be in, as told to the user.
const ACCEPTED_FORMATS: &str = ".jpeg or .png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// The item was received.
    Confirmation,
    /// The item could not be processed and was dead-lettered.
    Rejection,
    /// The item's record was deleted.
    Deleted,
}

impl Template {
    pub fn subject(self) -> &'static str {
        match self {
            Template::Confirmation => "New Image Upload",
            Template::Rejection => "Action Needed: Image Processing Failed",
            Template::Deleted => "Image Deleted",
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Template::Confirmation => "confirmation",
            Template::Rejection => "rejection",
            Template::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// A transient request to tell the user something. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub template: Template,
    pub item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl NotificationRequest {
    pub fn new(template: Template, item_id: impl Into<String>) -> Self {
        Self {
            template,
            item_id: item_id.into(),
            container_id: None,
        }
    }

    pub fn container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Location string used in messages, e.g. `s3://photos/a.png`.
    fn location(&self) -> String {
        match &self.container_id {
            Some(container) => format!("s3://{container}/{}", self.item_id),
            None => self.item_id.clone(),
        }
    }

    /// Plain-text body for the template. Rich rendering belongs to the transport.
    pub fn message(&self) -> String {
        match self.template {
            Template::Confirmation => {
                format!("We received your Image. Its URL is {}", self.location())
            }
            Template::Rejection => format!(
                "We were unable to process your image. Failed image URL is {}. \
                 Please upload a new image. Images must be in {ACCEPTED_FORMATS} format",
                self.location()
            ),
            Template::Deleted => format!(
                "Your image with name '{}' has been deleted. We hope you enjoyed our service!",
                self.item_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_names_location_and_formats() {
        let req = NotificationRequest::new(Template::Rejection, "x.exe").container("photos");
        let msg = req.message();
        assert!(msg.contains("s3://photos/x.exe"));
        assert!(msg.contains(".jpeg or .png"));
    }

    #[test]
    fn deleted_message_uses_bare_item_name() {
        let req = NotificationRequest::new(Template::Deleted, "p.png");
        assert!(req.message().contains("'p.png'"));
        assert_eq!(req.template.subject(), "Image Deleted");
    }
}
