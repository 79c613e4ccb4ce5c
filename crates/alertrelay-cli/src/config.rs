//! Host configuration file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level TOML document.
///
/// ```toml
/// [channels.ops-mail]
/// type = "smtp"
/// server = "mail.example.com"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub channels: BTreeMap<String, serde_json::Value>,
}

/// One configured channel instance.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Channel tables with their name filled in.
    pub fn channel_specs(&self) -> Result<Vec<ChannelSpec>> {
        let mut specs = Vec::with_capacity(self.channels.len());
        for (name, table) in &self.channels {
            let mut config = table.clone();
            let object = config
                .as_object_mut()
                .with_context(|| format!("channels.{} must be a table", name))?;
            let channel_type = object
                .get("type")
                .and_then(|v| v.as_str())
                .with_context(|| format!("channels.{} has no type", name))?
                .to_string();
            object
                .entry("name")
                .or_insert_with(|| serde_json::Value::String(name.clone()));

            specs.push(ChannelSpec {
                name: name.clone(),
                channel_type,
                config,
            });
        }
        Ok(specs)
    }
}
