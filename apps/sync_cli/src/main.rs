use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ConversationSyncService, SyncEvent};
use shared::domain::Conversation;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Keeps a live conversation list for one user and prints it on every change.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    username: String,
    /// Bearer token for REST calls; also sent when opening the socket.
    #[arg(long)]
    token: Option<String>,
    /// Settings file. Defaults to `chat_sync.toml` when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    rest_url: Option<String>,
    #[arg(long)]
    socket_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(url) = args.rest_url {
        settings.rest_base_url = url;
    }
    if let Some(url) = args.socket_url {
        settings.socket_url = Some(url);
    }

    let service = ConversationSyncService::from_settings(settings, &args.username, args.token)?;
    let local_username = args.username.clone();
    let _listing = service.on_list_changed(move |list| print_list(&local_username, list));
    let mut events = service.subscribe_events();

    service.connect_if_needed()?;
    info!(username = %args.username, "cli: syncing, press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::ConnectionChanged(true)) => println!("-- connected"),
                Ok(SyncEvent::ConnectionChanged(false)) => println!("-- reconnecting..."),
                Ok(SyncEvent::Error(message)) => warn!("cli: {message}"),
                Ok(SyncEvent::ListChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.logout().await;
    Ok(())
}

fn print_list(local_username: &str, list: &[Conversation]) {
    println!("== {} conversation(s)", list.len());
    for conversation in list {
        let name = conversation
            .display_name(local_username)
            .unwrap_or_else(|| "(no name yet)".to_string());
        let unread = match conversation.unread_count {
            0 => String::new(),
            n => format!(" [{n}]"),
        };
        match &conversation.last_message {
            Some(message) => println!(
                "{name}{unread}  {} {}: {}",
                message.sent_at.with_timezone(&chrono::Local).format("%H:%M"),
                message.sender_username,
                message.content
            ),
            None => println!("{name}{unread}"),
        }
    }
}
