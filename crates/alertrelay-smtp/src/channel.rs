//! SMTP channel facade.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{ConfigOption, SmtpConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventRecord};
use crate::formatter::MessageFormatter;
use crate::transport::{MailTransport, SmtpTransport};
use crate::worker::{DeliveryStats, DeliveryWorker, StatsCounters, WorkerState};

/// Relays events as email through a single background worker.
///
/// # Delivery contract
///
/// Delivery is best-effort and at-most-once. [`SmtpChannel::send`] only
/// hands the event to the worker; it never reports whether the mail went
/// out. Records whose body cannot be produced, and records the relay
/// refuses, are logged and dropped. Nothing is retried or persisted.
///
/// Records are delivered in the order they were accepted. `send` waits
/// while the hand-off queue is full, so a slow relay slows producers down
/// instead of growing memory.
pub struct SmtpChannel {
    name: String,
    config: SmtpConfig,
    sender: RwLock<Option<mpsc::Sender<EventRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: watch::Receiver<WorkerState>,
    stats: Arc<StatsCounters>,
}

impl SmtpChannel {
    /// Validate `config` and start a channel that submits through SMTP.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SmtpConfig) -> Result<Self> {
        Self::with_options(config, Vec::new())
    }

    /// Apply `options` to `config` in order, then validate and start.
    pub fn with_options(mut config: SmtpConfig, options: Vec<ConfigOption>) -> Result<Self> {
        for option in options {
            option(&mut config)?;
        }
        config.validate()?;
        let formatter = MessageFormatter::from_config(&config)?;
        let transport = Arc::new(SmtpTransport::from_config(&config)?);
        Self::start(config, formatter, transport)
    }

    /// Validate `config` and start a channel that delivers through `transport`.
    pub fn with_transport(config: SmtpConfig, transport: Arc<dyn MailTransport>) -> Result<Self> {
        config.validate()?;
        let formatter = MessageFormatter::from_config(&config)?;
        Self::start(config, formatter, transport)
    }

    fn start(
        config: SmtpConfig,
        formatter: MessageFormatter,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::Configuration(format!("SMTP channel needs a Tokio runtime: {}", e))
        })?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let worker = DeliveryWorker::new(&config, formatter, transport.clone());
        let state = worker.subscribe();
        let stats = worker.stats_handle();
        let handle = runtime.spawn(worker.run(receiver));

        tracing::info!(
            server = %config.relay_host(),
            port = config.relay_port(),
            transport = transport.kind(),
            recipients = ?config.recipients(),
            templated = config.template_source().is_some(),
            "SMTP channel started"
        );

        Ok(Self {
            name: "smtp".to_string(),
            config,
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            state,
            stats,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Snapshot `event` and hand it to the delivery worker.
    ///
    /// Waits while the queue is full. Returns [`Error::Closed`] once the
    /// channel has been closed; the outcome of the delivery itself is
    /// never reported here.
    pub async fn send<E: Event + ?Sized>(&self, event: &E) -> Result<()> {
        self.enqueue(EventRecord::from_event(event)).await
    }

    /// Hand an already built record to the delivery worker.
    pub async fn enqueue(&self, record: EventRecord) -> Result<()> {
        let sender = self.sender.read().await.clone();
        match sender {
            Some(sender) => sender.send(record).await.map_err(|_| self.closed()),
            None => Err(self.closed()),
        }
    }

    /// Blocking variant of [`SmtpChannel::send`] for producers outside the runtime.
    ///
    /// Panics if called from within an async context, like
    /// [`mpsc::Sender::blocking_send`].
    pub fn send_blocking<E: Event + ?Sized>(&self, event: &E) -> Result<()> {
        let record = EventRecord::from_event(event);
        let sender = self.sender.blocking_read().clone();
        match sender {
            Some(sender) => sender.blocking_send(record).map_err(|_| self.closed()),
            None => Err(self.closed()),
        }
    }

    fn closed(&self) -> Error {
        tracing::warn!(channel = %self.name, "Send on closed SMTP channel");
        Error::Closed(self.name.clone())
    }

    /// Stop accepting records and wait for the worker to drain the queue.
    ///
    /// Records already accepted are still delivered. Calling `close` again
    /// is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.sender.write().await.take();

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("delivery worker failed: {}", e)))?;
            tracing::info!(channel = %self.name, "SMTP channel closed");
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.sender.read().await.is_none()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for SmtpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpChannel")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
