#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

mod utils;

use relaychat::cache::{FileStore, KeyValueStore, MemoryStore};
use relaychat::config::{self, Config};
use relaychat::events::MessengerEvent;
use relaychat::messenger::Messenger;
use relaychat::models::Message;
use relaychat::runtime;
use relaychat::time::SystemClock;
use relaychat::transport::WsTransport;

/// Command line arguments for relaychat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "relaychat: a terminal chat client for a WebSocket message relay.",
    long_about = "relaychat keeps a best-effort live connection to a message relay, falls back to \
    offline mode after repeated failures and delivers queued messages once the relay is back.\n\n\
    Type a line to send it. Commands: /offline, /online, /flush, /status, /history, /clear, /quit."
)]
struct Args {
    /// Path to a JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Origin of the hosting page, e.g. https://chat.example.com
    #[arg(long)]
    origin: Option<String>,

    /// Explicit relay URL (ws:// or wss://)
    #[arg(long, value_name = "URL")]
    relay_url: Option<String>,

    /// Directory for cached messages and state
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long)]
    ephemeral: bool,

    /// Name shown to other participants
    #[arg(long)]
    name: Option<String>,

    /// Avatar reference sent with each message
    #[arg(long)]
    avatar: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
    }
    let mut config = Config::load()?;
    if let Some(origin) = &args.origin {
        config.origin = origin.clone();
    }
    if let Some(relay_url) = &args.relay_url {
        config.relay_url = Some(relay_url.clone());
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(name) = &args.name {
        config.display_name = name.clone();
    }
    if let Some(avatar) = &args.avatar {
        config.avatar = avatar.clone();
    }
    config.validate()?;
    Ok(config)
}

fn format_message(message: &Message) -> String {
    let time = chrono::DateTime::from_timestamp_millis(message.timestamp_ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    match &message.attachment {
        Some(attachment) => format!("[{}] {}: {} [{}]", time, message.sender, message.text, attachment.name),
        None => format!("[{}] {}: {}", time, message.sender, message.text),
    }
}

async fn print_events(mut events: broadcast::Receiver<MessengerEvent>) {
    loop {
        match events.recv().await {
            Ok(MessengerEvent::MessageAdded(message)) => println!("{}", format_message(&message)),
            Ok(MessengerEvent::OfflineModeChanged { enabled: true, reason }) => {
                println!("*** Offline mode on ({:?}). Messages will be queued.", reason)
            }
            Ok(MessengerEvent::OfflineModeChanged { enabled: false, .. }) => {
                println!("*** Offline mode off. Reconnecting...")
            }
            Ok(MessengerEvent::StateChanged(state)) => println!("*** Connection {}", state),
            Ok(MessengerEvent::SyncCompleted(report)) if report.sent + report.failed > 0 => {
                println!("*** Delivered {} queued messages ({} failed)", report.sent, report.failed)
            }
            Ok(MessengerEvent::SyncCompleted(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                error!("Event printer lagged, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let log_path = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_path, level)?;
    info!("relaychat starting on {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let config = build_config(&args)?;

    let backend: Box<dyn KeyValueStore> = if args.ephemeral {
        Box::new(MemoryStore::new())
    } else {
        let dir = config.resolve_data_dir()?;
        info!("Caching state in {}", dir.display());
        Box::new(FileStore::new(&dir).with_context(|| format!("Cannot use data directory {}", dir.display()))?)
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = WsTransport::new(events_tx);
    let messenger = Messenger::new(&config, backend, Box::new(transport), Arc::new(SystemClock))
        .context("Invalid relay configuration")?;

    for message in messenger.messages() {
        println!("{}", format_message(message));
    }

    let printer = tokio::spawn(print_events(messenger.subscribe()));
    let (handle, task) = runtime::spawn(messenger, events_rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/offline" => handle.enable_offline().await?,
            "/online" => handle.disable_offline().await?,
            "/flush" => handle.flush().await?,
            "/clear" => {
                handle.clear().await?;
                println!("*** History cleared");
            }
            "/status" => {
                let status = handle.status().await?;
                println!(
                    "*** {} | offline: {} | failures: {} | pending: {} | messages: {} | last sync: {}",
                    status.state,
                    status.offline,
                    status.failures,
                    status.pending,
                    status.messages,
                    status
                        .last_sync_ms
                        .and_then(chrono::DateTime::from_timestamp_millis)
                        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
            "/history" => {
                for message in handle.messages().await? {
                    println!("{}", format_message(&message));
                }
                let pending = handle.pending().await?;
                if !pending.is_empty() {
                    println!("*** {} messages waiting for delivery", pending.len());
                }
            }
            text => {
                handle.send(text, &config.display_name, &config.avatar).await?;
            }
        }
    }

    handle.shutdown().await?;
    if let Err(e) = task.await {
        error!("Messenger task failed: {}", e);
    }
    printer.abort();
    info!("relaychat exiting");
    Ok(())
}
