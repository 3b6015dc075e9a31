//! Mailhook - loads the plugin pipeline and replays one message through it
//!
//! The envelope comes from the command line and the message from stdin. The
//! accepted message, after plugin edits, is written to stdout.

use anyhow::{bail, Context, Result};
use mailhook_common::config::{Config, LoggingConfig};
use mailhook_common::types::{EmailAddress, Reply};
use mailhook_core::{DataResult, PluginLoader, Session};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(StructOpt)]
#[structopt(name = "mailhook", max_term_width = 80)]
struct Options {
    /// Configuration file
    /// [default: $MAILHOOK_CONFIG, ./mailhook.toml or /etc/mailhook/mailhook.toml]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Envelope sender. Leave empty for the null reverse-path.
    #[structopt(long, default_value = "")]
    from: String,

    /// Envelope recipient, may be repeated
    #[structopt(long = "to")]
    to: Vec<String>,

    /// Client address handed to the plugins
    #[structopt(long)]
    peer: Option<IpAddr>,

    /// Client HELO name
    #[structopt(long, default_value = "localhost")]
    helo: String,

    /// Print the built-in plugin names and exit
    #[structopt(long)]
    list_plugins: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();
    let loader = PluginLoader::with_builtins();

    if options.list_plugins {
        for name in loader.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = match &options.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    init_logging(&config.logging);

    info!(hostname = %config.server.hostname, plugins = ?config.pipeline.plugins, "Starting Mailhook");
    let pipeline = Arc::new(loader.load(&config).await.context("Failed to load plugins")?);

    let sender = parse_sender(&options.from)?;
    let recipients = options
        .to
        .iter()
        .map(|rcpt| EmailAddress::parse(rcpt).with_context(|| format!("Invalid recipient: {}", rcpt)))
        .collect::<Result<Vec<_>>>()?;
    if recipients.is_empty() {
        bail!("At least one --to recipient is required");
    }

    let mut raw = Vec::new();
    tokio::io::stdin().read_to_end(&mut raw).await?;

    let mut session = Session::new(pipeline, options.peer);
    session.helo(options.helo.as_str());

    let reply = session.mail_from(sender).await;
    ensure_accepted("MAIL FROM", &reply)?;
    for rcpt in recipients {
        let reply = session.rcpt_to(rcpt).await;
        ensure_accepted("RCPT TO", &reply)?;
    }

    match session.data(&raw).await {
        DataResult::Queued(message) => {
            info!(reply = %message.reply(), "Message accepted");
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&message.data).await?;
            stdout.flush().await?;
            Ok(())
        }
        DataResult::Rejected(reply) => bail!("DATA rejected: {}", reply),
    }
}

fn parse_sender(from: &str) -> Result<Option<EmailAddress>> {
    let from = from.trim().trim_start_matches('<').trim_end_matches('>');
    if from.is_empty() {
        return Ok(None);
    }
    EmailAddress::parse(from)
        .map(Some)
        .with_context(|| format!("Invalid sender: {}", from))
}

fn ensure_accepted(command: &str, reply: &Reply) -> Result<()> {
    if reply.is_positive() {
        return Ok(());
    }
    warn!(command, reply = %reply, "Command rejected");
    bail!("{} rejected: {}", command, reply)
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailhook_core={}", config.level, config.level)));

    // stdout carries the message, logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
