//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString since it may carry
//! credentials.

use crate::error::{Error, Result};
use crate::model::scheduler::DEFAULT_MAX_PARALLELISM;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Level for the lifecycle event target; unset follows `log_level`.
    pub event_log_level: Option<String>,
    pub max_parallelism: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("WORKPOOL_DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_log_level: std::env::var("WORKPOOL_EVENT_LOG_LEVEL").ok(),
            max_parallelism: match std::env::var("WORKPOOL_MAX_PARALLELISM") {
                Ok(raw) => raw.parse().map_err(|_| {
                    Error::Config(format!(
                        "WORKPOOL_MAX_PARALLELISM must be a positive integer, got {raw:?}"
                    ))
                })?,
                Err(_) => DEFAULT_MAX_PARALLELISM,
            },
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
