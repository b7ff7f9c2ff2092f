//! HTTP webhook transport.
//!
//! POSTs one JSON document per notification. The receiving service owns
//! rendering and delivery to the user's mailbox.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use super::Notifier;
use crate::error::{Error, Result};
use crate::model::NotificationRequest;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    message: String,
    #[serde(flatten)]
    request: &'a NotificationRequest,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: SecretString,
}

impl WebhookNotifier {
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<()> {
        let payload = WebhookPayload {
            subject: request.template.subject(),
            message: request.message(),
            request,
        };
        let response = self
            .client
            .post(self.url.expose_secret())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Notifier(format!("webhook returned {status}")));
        }
        debug!(template = %request.template, item = %request.item_id, "webhook accepted notification");
        Ok(())
    }
}
