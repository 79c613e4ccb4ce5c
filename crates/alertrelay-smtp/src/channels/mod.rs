//! Channel abstractions shared with the host.
//!
//! The host owns the mapping from channel type to factory; this crate only
//! provides the SMTP constructor behind [`SmtpChannelFactory`].

pub mod smtp;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::event::EventRecord;

pub use smtp::SmtpChannelFactory;

/// A sink the host pushes event records into.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &str;

    /// Get the channel type.
    fn channel_type(&self) -> &str;

    /// Hand a record to the channel. Does not report delivery results.
    async fn send(&self, record: EventRecord) -> Result<()>;

    /// Stop accepting records and release background resources.
    async fn close(&self) -> Result<()>;
}

/// Factory trait for creating channels from configuration.
pub trait ChannelFactory: Send + Sync {
    /// Get the channel type this factory creates.
    fn channel_type(&self) -> &str;

    /// Create a channel from configuration.
    fn create(&self, config: &serde_json::Value) -> Result<Arc<dyn NotificationChannel>>;

    /// JSON schema of the accepted configuration.
    fn config_schema(&self) -> Option<serde_json::Value> {
        None
    }
}
