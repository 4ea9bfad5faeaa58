use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{
    config::{load_settings, load_settings_from},
    timeline::DeliveryState,
    ChatClient, ChatEvent, RoomView, StaticTokenProvider,
};
use shared::domain::{MessageKind, RoomId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{parse_line, CliCommand};

#[derive(Parser, Debug)]
struct Args {
    /// Chat server base url; overrides the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    user: String,
    /// Application auth token, e.g. minted with the `tools` binary.
    #[arg(long, env = "APP_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long)]
    room: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }

    let client = ChatClient::new(
        settings,
        UserId::from(args.user.as_str()),
        Arc::new(StaticTokenProvider::new(Some(args.token))),
    )?;
    let printer = tokio::spawn(print_events(client.subscribe()));

    let snapshot = client.start().await?;
    println!("connection: {:?}", snapshot.state);

    let mut view = Some(client.open_room(&RoomId::from(args.room.as_str())).await?);
    if let Some(view) = &view {
        println!("joined {} (type /quit to leave)", view.room_id());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == CliCommand::Quit {
            break;
        }
        if let Err(err) = run_command(&client, &mut view, command).await {
            println!("error: {err}");
        }
    }

    if let Some(view) = view.take() {
        view.close().await;
    }
    client.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run_command(
    client: &Arc<ChatClient>,
    view: &mut Option<RoomView>,
    command: CliCommand,
) -> Result<()> {
    if let CliCommand::Join(room_id) = &command {
        if let Some(old) = view.take() {
            old.close().await;
        }
        *view = Some(client.open_room(room_id).await?);
        println!("joined {room_id}");
        return Ok(());
    }
    if command == CliCommand::Who {
        for user in client.online_users().await {
            println!("  {} ({})", user.username, user.id);
        }
        return Ok(());
    }

    let Some(current) = view.as_ref() else {
        bail!("not in a room; use /join <room>");
    };
    let room_id = current.room_id().clone();
    match command {
        CliCommand::Say(text) => {
            client
                .send_message(&room_id, MessageKind::Text, &text)
                .await?;
        }
        CliCommand::Typing(on) => client.set_typing(&room_id, on).await?,
        CliCommand::Retry(temp_id) => client.retry_message(&room_id, &temp_id).await?,
        CliCommand::History => {
            for entry in current.messages().await {
                let marker = match &entry.delivery {
                    DeliveryState::Pending => " (sending)".to_string(),
                    DeliveryState::Confirmed => String::new(),
                    DeliveryState::Failed { reason } => {
                        format!(" (failed: {reason}; /retry {})", entry.message.id)
                    }
                };
                println!(
                    "  [{}] {}: {}{marker}",
                    entry.message.created_at.format("%H:%M:%S"),
                    entry.message.sender_id,
                    entry.message.content
                );
            }
        }
        CliCommand::Leave => {
            if let Some(old) = view.take() {
                old.close().await;
            }
            println!("left {room_id}");
        }
        CliCommand::Call(call_type) => {
            client.start_call(&room_id, call_type).await?;
            println!("media token issued; waiting for the media transport");
        }
        CliCommand::Hangup => client.end_call().await?,
        CliCommand::Join(_) | CliCommand::Who | CliCommand::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ChatEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: event printer lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ChatEvent::ConnectionChanged(snapshot) => {
                println!("* connection {:?}", snapshot.state);
            }
            ChatEvent::MessageFailed { temp_id, reason, .. } => {
                println!("* message {temp_id} failed: {reason}");
            }
            ChatEvent::TypingChanged { room_id, users } => {
                if users.is_empty() {
                    continue;
                }
                let names: Vec<&str> = users.iter().map(|u| u.display_name.as_str()).collect();
                println!("* {} typing in {room_id}", names.join(", "));
            }
            ChatEvent::OnlineUsersChanged(users) => {
                println!("* {} online", users.len());
            }
            ChatEvent::CallStateChanged(state) => println!("* call {:?}", state.phase()),
            ChatEvent::Error { kind, message } => println!("! {kind:?}: {message}"),
            ChatEvent::HistoryLoaded { room_id, merge } => {
                println!("* {room_id}: {} messages loaded", merge.appended);
            }
            ChatEvent::MembershipChanged { .. }
            | ChatEvent::TimelineUpdated { .. }
            | ChatEvent::MessageConfirmed { .. } => {}
        }
    }
}
