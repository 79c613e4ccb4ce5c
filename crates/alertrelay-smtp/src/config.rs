//! SMTP channel configuration.
//!
//! The host loads the raw values (TOML, JSON, environment, ...) and hands
//! them over either as a ready [`SmtpConfig`] or as a list of
//! [`ConfigOption`]s. Validation happens exactly once, when the channel is
//! built.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Standard mail submission port.
pub const DEFAULT_SUBMISSION_PORT: u16 = 587;

fn default_port() -> u16 {
    DEFAULT_SUBMISSION_PORT
}

fn default_queue_capacity() -> usize {
    1
}

fn default_tick_interval() -> u64 {
    1000
}

/// Configuration for an SMTP channel.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Relay host, optionally with an explicit `host:port`.
    pub server: String,
    /// Submission port used when `server` carries none.
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub subject: String,
    pub from: String,
    /// Recipients. The first entry is required; later blank entries are ignored.
    pub to: Vec<String>,
    /// Optional body template source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,
    /// Records the hand-off queue holds before `send` waits for the worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Idle wake-up period of the worker loop in milliseconds, 0 disables it.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            subject: String::new(),
            from: String::new(),
            to: Vec::new(),
            body_template: None,
            queue_capacity: default_queue_capacity(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("subject", &self.subject)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("body_template", &self.body_template)
            .field("queue_capacity", &self.queue_capacity)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .finish()
    }
}

impl SmtpConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn add_recipient(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    pub fn with_recipients(mut self, addresses: Vec<String>) -> Self {
        self.to = addresses;
        self
    }

    pub fn with_body_template(mut self, source: impl Into<String>) -> Self {
        self.body_template = Some(source.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check every required field. Templates are compiled separately.
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::missing("mail server", "mail.example.com"));
        }
        if self.username.is_empty() {
            return Err(Error::missing("username", "abc@example.com"));
        }
        if self.password.is_empty() {
            return Err(Error::missing("password", "password"));
        }
        if self.subject.is_empty() {
            return Err(Error::missing("email subject", "Security alerts"));
        }
        if self.from.is_empty() {
            return Err(Error::missing("From address", "alert@example.com"));
        }
        if self.to.first().map_or(true, |first| first.trim().is_empty()) {
            return Err(Error::missing(
                "At least first recipient",
                r#"["admin1@example.com","admin2@example.com"]"#,
            ));
        }
        if self.relay_port() == 0 {
            return Err(Error::Configuration("SMTP port must not be 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Configuration("queue_capacity must be at least 1".to_string()));
        }

        self.from.parse::<lettre::Address>().map_err(|e| {
            Error::Configuration(format!("Invalid from address '{}': {}", self.from, e))
        })?;
        for address in self.recipients() {
            address.parse::<lettre::Address>().map_err(|e| {
                Error::Configuration(format!("Invalid to address '{}': {}", address, e))
            })?;
        }

        Ok(())
    }

    /// Non-blank recipients in configured order.
    pub fn recipients(&self) -> Vec<&str> {
        self.to
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Relay host without any port suffix.
    pub fn relay_host(&self) -> &str {
        match split_host_port(self.server.trim()) {
            Some((host, _)) => host,
            None => self.server.trim(),
        }
    }

    /// Port from `server` if it carries one, `port` otherwise.
    pub fn relay_port(&self) -> u16 {
        match split_host_port(self.server.trim()) {
            Some((_, port)) => port,
            None => self.port,
        }
    }

    /// Worker wake-up period, `None` when disabled.
    pub fn tick_interval(&self) -> Option<Duration> {
        if self.tick_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.tick_interval_ms))
        }
    }

    /// Body template source, if one is set and non-empty.
    pub fn template_source(&self) -> Option<&str> {
        self.body_template.as_deref().filter(|s| !s.is_empty())
    }
}

fn split_host_port(server: &str) -> Option<(&str, u16)> {
    let (host, port) = server.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

/// A configuration step applied before validation.
pub type ConfigOption = Box<dyn FnOnce(&mut SmtpConfig) -> Result<()> + Send>;

/// Constructors for [`ConfigOption`]s.
pub mod options {
    use super::{ConfigOption, SmtpConfig};
    use crate::error::Error;

    /// Replace the whole configuration with one decoded from `value`.
    ///
    /// Unknown keys such as `type` or `name` are ignored so a host can pass
    /// its raw channel table straight through.
    pub fn from_value(value: serde_json::Value) -> ConfigOption {
        Box::new(move |config: &mut SmtpConfig| {
            *config = serde_json::from_value(value)
                .map_err(|e| Error::Configuration(format!("Cannot decode SMTP config: {}", e)))?;
            Ok(())
        })
    }

    pub fn server(server: impl Into<String>) -> ConfigOption {
        let server = server.into();
        Box::new(move |config: &mut SmtpConfig| {
            config.server = server;
            Ok(())
        })
    }

    pub fn credentials(username: impl Into<String>, password: impl Into<String>) -> ConfigOption {
        let username = username.into();
        let password = password.into();
        Box::new(move |config: &mut SmtpConfig| {
            config.username = username;
            config.password = password;
            Ok(())
        })
    }

    pub fn subject(subject: impl Into<String>) -> ConfigOption {
        let subject = subject.into();
        Box::new(move |config: &mut SmtpConfig| {
            config.subject = subject;
            Ok(())
        })
    }

    pub fn from(from: impl Into<String>) -> ConfigOption {
        let from = from.into();
        Box::new(move |config: &mut SmtpConfig| {
            config.from = from;
            Ok(())
        })
    }

    pub fn to(recipients: Vec<String>) -> ConfigOption {
        Box::new(move |config: &mut SmtpConfig| {
            config.to = recipients;
            Ok(())
        })
    }

    pub fn body_template(source: impl Into<String>) -> ConfigOption {
        let source = source.into();
        Box::new(move |config: &mut SmtpConfig| {
            config.body_template = Some(source);
            Ok(())
        })
    }
}
