//! Error types for the SMTP notification channel.
//!
//! Only [`Error::Configuration`] and [`Error::Template`] ever reach the
//! caller of a constructor. Formatting and delivery failures are reported
//! through `tracing` inside the delivery worker and then dropped.

use thiserror::Error;

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the notification channel.
#[derive(Debug, Error)]
pub enum Error {
    /// A required configuration value is missing or invalid.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The body template could not be compiled.
    #[error("Template error: {0}")]
    Template(String),

    /// An event record could not be turned into a message body.
    #[error("Formatting failed: {0}")]
    Formatting(String),

    /// The relay could not be reached, refused the credentials or rejected the message.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The channel was already closed.
    #[error("Channel closed: {0}")]
    Closed(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn missing(field: &str, example: &str) -> Self {
        Self::Configuration(format!("{} not set, ex: {}", field, example))
    }

    /// Whether this error was raised while building a channel.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Template(_))
    }
}
