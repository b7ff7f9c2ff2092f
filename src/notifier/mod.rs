//! User notifications.
//!
//! Notifier failures never escape a consumer: [`notify_logged`] logs them and
//! moves on. Retrying, if wanted, is the transport's business.

pub mod webhook;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{error, info};

use crate::error::Result;
use crate::model::NotificationRequest;
use crate::telemetry::metrics;

pub use webhook::WebhookNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<()>;
}

/// Send and swallow. Returns whether the notifier accepted the request.
pub async fn notify_logged(notifier: &dyn Notifier, request: &NotificationRequest) -> bool {
    let template = request.template.to_string();
    match notifier.send(request).await {
        Ok(()) => {
            metrics::notifications().add(
                1,
                &[
                    KeyValue::new("template", template),
                    KeyValue::new("result", "sent"),
                ],
            );
            true
        }
        Err(e) => {
            error!(
                template = %request.template,
                item = %request.item_id,
                error = %e,
                "notification failed"
            );
            metrics::notifications().add(
                1,
                &[
                    KeyValue::new("template", template),
                    KeyValue::new("result", "failed"),
                ],
            );
            false
        }
    }
}

/// Writes notifications to the log. Used when no transport is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<()> {
        info!(
            template = %request.template,
            subject = request.template.subject(),
            item = %request.item_id,
            message = %request.message(),
            "notification"
        );
        Ok(())
    }
}

/// Development notifier: holds every request in memory instead of sending
/// it. Pair it with [`Pipeline::in_memory`](crate::pipeline::Pipeline::in_memory)
/// to inspect what a local run would have sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(())
    }
}
