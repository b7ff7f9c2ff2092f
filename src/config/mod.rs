//! Typed configuration.
//!
//! Process settings (connection strings, endpoints) come from environment
//! variables and are loaded once at startup. Pipeline tuning lives in a TOML
//! file, see [`pipeline::PipelineSettings`].
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod pipeline;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub use pipeline::{Binding, PipelineSettings, RouteSpec};

#[derive(Debug)]
pub struct Config {
    /// Absent when running fully in memory.
    pub database_url: Option<SecretString>,
    /// Absent means notifications are only logged.
    pub notifier_webhook_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: optional_var("DATABASE_URL")?.map(SecretString::from),
            notifier_webhook_url: optional_var("NOTIFIER_WEBHOOK_URL")?.map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT")?,
            log_level: optional_var("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
        })
    }

    /// The database URL, for commands that need Postgres.
    pub fn database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }
}

/// Unset and empty are the same thing; non-UTF-8 is an error.
fn optional_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::Config(format!(
            "environment variable {name} is not valid UTF-8"
        ))),
    }
}
