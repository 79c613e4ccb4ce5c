//! SMTP channel factory.

use async_trait::async_trait;
use std::sync::Arc;

use super::{ChannelFactory, NotificationChannel};
use crate::channel::SmtpChannel;
use crate::config::{options, SmtpConfig};
use crate::error::Result;
use crate::event::EventRecord;

#[async_trait]
impl NotificationChannel for SmtpChannel {
    fn name(&self) -> &str {
        SmtpChannel::name(self)
    }

    fn channel_type(&self) -> &str {
        "smtp"
    }

    async fn send(&self, record: EventRecord) -> Result<()> {
        self.enqueue(record).await
    }

    async fn close(&self) -> Result<()> {
        SmtpChannel::close(self).await
    }
}

/// Factory for creating SMTP channels.
pub struct SmtpChannelFactory;

impl ChannelFactory for SmtpChannelFactory {
    fn channel_type(&self) -> &str {
        "smtp"
    }

    fn create(&self, config: &serde_json::Value) -> Result<Arc<dyn NotificationChannel>> {
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("smtp")
            .to_string();

        let options = vec![options::from_value(config.clone())];
        let channel = SmtpChannel::with_options(SmtpConfig::default(), options)?.with_name(name);

        Ok(Arc::new(channel))
    }

    fn config_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "server": {"type": "string"},
                "port": {"type": "integer", "default": 587},
                "username": {"type": "string"},
                "password": {"type": "string"},
                "subject": {"type": "string"},
                "from": {"type": "string"},
                "to": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                "body_template": {"type": "string"},
                "queue_capacity": {"type": "integer", "minimum": 1, "default": 1},
                "tick_interval_ms": {"type": "integer", "minimum": 0, "default": 1000}
            },
            "required": ["server", "username", "password", "subject", "from", "to"]
        }))
    }
}
