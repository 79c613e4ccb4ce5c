//! Background delivery loop.
//!
//! One worker per channel pulls records off the hand-off queue, formats
//! them and submits them through the transport, strictly one at a time.
//! Failures are logged and the record is dropped; there is no retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::SmtpConfig;
use crate::event::EventRecord;
use crate::formatter::MessageFormatter;
use crate::transport::{ComposedMessage, MailTransport};

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Waiting for the next record.
    Idle,
    Formatting,
    Sending,
    /// Queue closed and drained. Terminal.
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Formatting => "formatting",
            Self::Sending => "sending",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Formatting produced an empty body, nothing was sent.
    EmptyBody,
    FormatFailed,
    DeliveryFailed,
}

/// Counters kept by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Records taken off the queue
    pub received: u64,
    /// Records accepted by the relay
    pub delivered: u64,
    /// Records dropped because the body was empty
    pub dropped_empty: u64,
    /// Records dropped because formatting failed
    pub format_failures: u64,
    /// Records dropped because the transport failed
    pub delivery_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    received: AtomicU64,
    delivered: AtomicU64,
    dropped_empty: AtomicU64,
    format_failures: AtomicU64,
    delivery_failures: AtomicU64,
}

impl StatsCounters {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.delivered,
            DeliveryOutcome::EmptyBody => &self.dropped_empty,
            DeliveryOutcome::FormatFailed => &self.format_failures,
            DeliveryOutcome::DeliveryFailed => &self.delivery_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_empty: self.dropped_empty.load(Ordering::Relaxed),
            format_failures: self.format_failures.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Single consumer of a channel's hand-off queue.
pub struct DeliveryWorker {
    formatter: MessageFormatter,
    transport: Arc<dyn MailTransport>,
    from: String,
    to: Vec<String>,
    subject: String,
    tick: Option<Duration>,
    state: watch::Sender<WorkerState>,
    stats: Arc<StatsCounters>,
}

impl DeliveryWorker {
    pub fn new(
        config: &SmtpConfig,
        formatter: MessageFormatter,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            formatter,
            transport,
            from: config.from.clone(),
            to: config.recipients().into_iter().map(String::from).collect(),
            subject: config.subject.clone(),
            tick: config.tick_interval(),
            state,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Watch handle on the worker state.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub(crate) fn stats_handle(&self) -> Arc<StatsCounters> {
        self.stats.clone()
    }

    /// Run until the queue is closed and empty.
    pub async fn run(self, mut requests: mpsc::Receiver<EventRecord>) {
        let mut ticker = self.tick.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            let next = match ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    biased;
                    record = requests.recv() => Some(record),
                    _ = ticker.tick() => None,
                },
                None => Some(requests.recv().await),
            };

            match next {
                Some(Some(record)) => {
                    self.handle(record).await;
                }
                Some(None) => break,
                None => tracing::trace!(subject = %self.subject, "Delivery worker idle"),
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        tracing::info!(subject = %self.subject, "Delivery worker stopped");
    }

    /// Format and send one record.
    pub async fn handle(&self, record: EventRecord) -> DeliveryOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process(&record).await;
        self.stats.record(outcome);
        self.state.send_replace(WorkerState::Idle);
        outcome
    }

    async fn process(&self, record: &EventRecord) -> DeliveryOutcome {
        self.state.send_replace(WorkerState::Formatting);
        let body = match self.formatter.format(record) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, fields = record.len(), "Fail to create email body");
                return DeliveryOutcome::FormatFailed;
            }
        };
        if body.is_empty() {
            tracing::info!(fields = record.len(), "Empty email, dropping record");
            return DeliveryOutcome::EmptyBody;
        }

        self.state.send_replace(WorkerState::Sending);
        let message = ComposedMessage::new(
            self.from.clone(),
            self.to.clone(),
            self.subject.clone(),
            body,
        );
        match self.transport.deliver(&message).await {
            Ok(()) => {
                tracing::debug!(
                    transport = self.transport.kind(),
                    recipients = ?message.to,
                    "Email sent"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                tracing::error!(
                    transport = self.transport.kind(),
                    recipients = ?message.to,
                    error = %e,
                    "Fail to send email"
                );
                DeliveryOutcome::DeliveryFailed
            }
        }
    }
}
