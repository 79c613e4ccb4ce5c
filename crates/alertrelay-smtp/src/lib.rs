//! SMTP notification channel for monitoring events.
//!
//! Events pushed into an [`SmtpChannel`] are queued, turned into a message
//! body (a user template or compact JSON) and submitted to a mail relay by
//! a single background worker.
//!
//! ## Delivery guarantees
//!
//! None beyond best effort. Delivery is at-most-once: formatting and relay
//! failures are logged through `tracing` and the record is dropped. There
//! is no retry and no on-disk spool. Only configuration and template errors
//! are returned to the caller, at construction time.
//!
//! ## Body templates
//!
//! Templates are Jinja, with dotted actions (`{{.a}}`, `{{.}}`,
//! `{{if .a}}`, `{{range $k, $v := .}}`, `{{end}}`) accepted as well; see
//! [`formatter`] for the supported subset. Fields the record does not
//! carry print as [`NO_VALUE`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use alertrelay_smtp::{SmtpChannel, SmtpConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::new("mail.example.com")
//!         .with_credentials("alerts", "secret")
//!         .with_subject("Honeypot alert")
//!         .with_from("alerts@example.com")
//!         .add_recipient("oncall@example.com")
//!         .with_body_template("{{.category}}: {{.message}}");
//!
//!     let channel = SmtpChannel::new(config)?;
//!     channel
//!         .send(&serde_json::json!({"category": "ssh", "message": "login attempt"}))
//!         .await?;
//!     channel.close().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod channels;
pub mod config;
pub mod error;
pub mod event;
pub mod formatter;
pub mod transport;
pub mod worker;

pub use channel::SmtpChannel;
pub use channels::{ChannelFactory, NotificationChannel, SmtpChannelFactory};
pub use config::{options, ConfigOption, SmtpConfig, DEFAULT_SUBMISSION_PORT};
pub use error::{Error, Result};
pub use event::{Event, EventRecord};
pub use formatter::{BodyTemplate, MessageFormatter, NO_VALUE};
pub use transport::{ComposedMessage, MailTransport, RecordingTransport, SmtpTransport};
pub use worker::{DeliveryOutcome, DeliveryStats, DeliveryWorker, WorkerState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
