//! Outbound mail transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tokio::sync::Mutex;

use crate::config::SmtpConfig;
use crate::error::{Error, Result};

/// One message ready for submission. Built per delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl ComposedMessage {
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Minimal RFC 5322 text: To, From and Subject headers, a blank line, the body.
    pub fn formatted(&self) -> String {
        format!(
            "To: {}\r\nFrom: {}\r\nSubject: {}\r\n\r\n{}\r\n",
            self.to.join(","),
            self.from,
            self.subject,
            self.body
        )
    }

    /// SMTP envelope covering every recipient.
    pub fn envelope(&self) -> Result<Envelope> {
        let from = parse_address(&self.from)?;
        let to = self
            .to
            .iter()
            .map(|addr| parse_address(addr))
            .collect::<Result<Vec<_>>>()?;
        Envelope::new(Some(from), to)
            .map_err(|e| Error::Delivery(format!("Invalid envelope: {}", e)))
    }
}

fn parse_address(addr: &str) -> Result<Address> {
    addr.trim()
        .parse()
        .map_err(|e| Error::Delivery(format!("Invalid address '{}': {}", addr, e)))
}

/// Sends composed messages to a relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Transport kind, used in log output.
    fn kind(&self) -> &str;

    /// Submit one message to all of its recipients in a single call.
    async fn deliver(&self, message: &ComposedMessage) -> Result<()>;
}

/// Authenticated SMTP submission through lettre.
///
/// Each delivery opens a fresh session, then authenticates with PLAIN (or
/// LOGIN) using the channel credentials. Remote relays must offer STARTTLS;
/// a relay without it fails every delivery. Loopback relays (`localhost`,
/// `127.0.0.1`, `::1`) upgrade when STARTTLS is offered and otherwise stay
/// on plain text.
pub struct SmtpTransport {
    relay: String,
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let host = config.relay_host();
        let port = config.relay_port();
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let invalid = |e: lettre::transport::smtp::Error| {
            Error::Configuration(format!("Invalid SMTP server '{}': {}", host, e))
        };
        let builder = if is_loopback(host) {
            let tls = TlsParameters::new(host.to_string()).map_err(invalid)?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .tls(Tls::Opportunistic(tls))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(invalid)?
        };
        let inner = builder
            .port(port)
            .credentials(creds)
            .authentication(vec![Mechanism::Plain, Mechanism::Login])
            .build();

        Ok(Self {
            relay: format!("{}:{}", host, port),
            inner,
        })
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn kind(&self) -> &str {
        "smtp"
    }

    async fn deliver(&self, message: &ComposedMessage) -> Result<()> {
        let envelope = message.envelope()?;
        tracing::debug!(
            relay = %self.relay,
            from = %message.from,
            recipients = ?message.to,
            "Submitting message"
        );

        self.inner
            .send_raw(&envelope, message.formatted().as_bytes())
            .await
            .map(|_| ())
            .map_err(|e| Error::Delivery(format!("Fail to send email via {}: {}", self.relay, e)))
    }
}

/// In-memory transport that records every message instead of sending it.
///
/// Useful for hosts running without a relay and for tests. It can be told
/// to fail a number of upcoming deliveries.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<ComposedMessage>>>,
    attempts: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of delivery attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages that were delivered, in delivery order.
    pub async fn sent(&self) -> Vec<ComposedMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
        self.attempts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    fn kind(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, message: &ComposedMessage) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Delivery("connection refused".to_string()));
        }

        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}
