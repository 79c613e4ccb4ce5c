//! Command-line host for AlertRelay notification channels.

mod config;
mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use alertrelay_smtp::{EventRecord, NotificationChannel};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::config::HostConfig;
use crate::registry::FactoryRegistry;

/// AlertRelay - forward monitoring events as email notifications.
#[derive(Parser, Debug)]
#[command(name = "alertrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Read JSON events (one object per line) and push them to every channel.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Event file, stdin when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Validate the configuration and build every channel without sending.
    Check {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the configuration schema of a channel type.
    Schema {
        /// Channel type, e.g. smtp.
        #[arg(required = true)]
        channel_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let registry = FactoryRegistry::with_builtin();
    match args.command {
        Command::Run { config, input } => run(&registry, &config, input.as_deref()).await,
        Command::Check { config } => check(&registry, &config).await,
        Command::Schema { channel_type } => schema(&registry, &channel_type),
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var("ALERTRELAY_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "alertrelay={lvl},alertrelay_smtp={lvl},warn",
            lvl = default_level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

async fn build_channels(
    registry: &FactoryRegistry,
    path: &Path,
) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let host = HostConfig::load(path)?;
    let specs = host.channel_specs()?;
    if specs.is_empty() {
        anyhow::bail!("No channels configured in {}", path.display());
    }

    let mut channels = Vec::with_capacity(specs.len());
    for spec in &specs {
        match registry.build(spec) {
            Ok(channel) => channels.push(channel),
            Err(e) => {
                close_all(&channels).await;
                return Err(e);
            }
        }
    }
    Ok(channels)
}

async fn close_all(channels: &[Arc<dyn NotificationChannel>]) {
    for channel in channels {
        if let Err(e) = channel.close().await {
            tracing::warn!(channel = channel.name(), error = %e, "Failed to close channel");
        }
    }
}

async fn run(registry: &FactoryRegistry, config: &Path, input: Option<&Path>) -> Result<()> {
    let channels = build_channels(registry, config).await?;

    let forwarded = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            forward_events(BufReader::new(file), &channels).await
        }
        None => forward_events(BufReader::new(tokio::io::stdin()), &channels).await,
    };

    close_all(&channels).await;
    let count = forwarded?;
    tracing::info!(events = count, channels = channels.len(), "Input exhausted");
    Ok(())
}

/// Push every JSON object line from `reader` to all channels.
async fn forward_events<R>(reader: R, channels: &[Arc<dyn NotificationChannel>]) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping invalid JSON event");
                continue;
            }
        };
        if !value.is_object() {
            tracing::warn!(line = line_no, "Skipping event that is not a JSON object");
            continue;
        }

        let record = EventRecord::from_event(&value);
        for channel in channels {
            channel.send(record.clone()).await?;
        }
        count += 1;
    }

    Ok(count)
}

async fn check(registry: &FactoryRegistry, config: &Path) -> Result<()> {
    let channels = build_channels(registry, config).await?;
    for channel in &channels {
        println!("{} ({}): ok", channel.name(), channel.channel_type());
    }
    close_all(&channels).await;
    Ok(())
}

fn schema(registry: &FactoryRegistry, channel_type: &str) -> Result<()> {
    let factory = registry
        .get(channel_type)
        .with_context(|| format!("Unknown channel type '{}'", channel_type))?;
    let schema = factory
        .config_schema()
        .with_context(|| format!("Channel type '{}' has no schema", channel_type))?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertrelay_smtp::{RecordingTransport, SmtpChannel, SmtpConfig};

    fn recording_channel() -> (Arc<dyn NotificationChannel>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let config = SmtpConfig::new("mail.example.com")
            .with_credentials("u", "p")
            .with_subject("Alert")
            .with_from("a@example.com")
            .add_recipient("b@example.com");
        let channel = SmtpChannel::with_transport(config, transport.clone()).unwrap();
        (Arc::new(channel), transport)
    }

    #[tokio::test]
    async fn test_forward_events_skips_bad_lines() {
        let (channel, transport) = recording_channel();
        let input = b"{\"msg\":\"one\"}\n\nnot json\n[1,2]\n{\"msg\":\"two\"}\n";

        let count = forward_events(&input[..], &[channel.clone()]).await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(count, 2);
        let bodies: Vec<String> = transport.sent().await.into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![r#"{"msg":"one"}"#, r#"{"msg":"two"}"#]);
    }

    #[tokio::test]
    async fn test_forward_to_closed_channel_fails() {
        let (channel, _transport) = recording_channel();
        channel.close().await.unwrap();

        let result = forward_events(&b"{\"msg\":\"late\"}\n"[..], &[channel]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["alertrelay", "run", "--config", "a.toml"]).unwrap();
        match args.command {
            Command::Run { config, input } => {
                assert_eq!(config, PathBuf::from("a.toml"));
                assert!(input.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
