//! Channel type registry owned by the host.

use std::collections::BTreeMap;
use std::sync::Arc;

use alertrelay_smtp::{ChannelFactory, NotificationChannel, SmtpChannelFactory};
use anyhow::{anyhow, Context, Result};

use crate::config::ChannelSpec;

/// Maps channel type names to their constructors.
pub struct FactoryRegistry {
    factories: BTreeMap<String, Box<dyn ChannelFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in channel type.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SmtpChannelFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn ChannelFactory>) {
        self.factories.insert(factory.channel_type().to_string(), factory);
    }

    pub fn get(&self, channel_type: &str) -> Option<&dyn ChannelFactory> {
        self.factories.get(channel_type).map(|f| f.as_ref())
    }

    pub fn types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build one channel, failing on unknown types or invalid configuration.
    pub fn build(&self, spec: &ChannelSpec) -> Result<Arc<dyn NotificationChannel>> {
        let factory = self.get(&spec.channel_type).ok_or_else(|| {
            anyhow!(
                "channels.{}: unknown channel type '{}' (known: {})",
                spec.name,
                spec.channel_type,
                self.types().join(", ")
            )
        })?;
        factory
            .create(&spec.config)
            .with_context(|| format!("channels.{}", spec.name))
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
