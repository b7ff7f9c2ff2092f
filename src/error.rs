//! Error types for bucket-relay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The event can never be processed as-is (e.g. a disallowed extension).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("item not found: {0}")]
    NotFound(String),

    /// The record store could not be reached. Expected to clear on redelivery.
    #[error("store unavailable: {0}")]
    Store(String),

    #[error("notifier error: {0}")]
    Notifier(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failures that no amount of redelivery will fix.
    ///
    /// Only used to label logs and metrics: terminal and transient failures
    /// take the same redelivery path to the dead-letter queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::NotFound(_))
    }

    /// Short, stable label for metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Store(_) | Error::Database(_) => "store",
            Error::Notifier(_) | Error::Http(_) => "notifier",
            Error::Queue(_) => "queue",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
