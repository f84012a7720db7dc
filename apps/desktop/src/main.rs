use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    attachments::PendingFile, scroll::ScrollAction, ChatClient, ClientConfig, ClientEvent,
    ConnectionState,
};
use shared::{domain::MessageId, protocol::Message};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
    #[arg(long, default_value_t = 50)]
    page_size: u32,
}

const HELP: &str =
    "commands: /attach <path>.. | /edit <id> <text> | /delete <id> | /older | /latest | /who | /quit";

/// The terminal is measured in messages: one row each.
const VIEW_ROWS: f64 = 20.0;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let client = ChatClient::new(ClientConfig {
        server_url: args.server_url,
        page_size: args.page_size,
        scroll_bottom_threshold: 2.0,
        scroll_top_threshold: 1.0,
        ..ClientConfig::default()
    });
    let login = client.login(&args.username).await?;
    println!("Logged in as {} (user_id={})", login.display_name, login.user_id.0);
    println!("{HELP}");

    tokio::spawn(print_events(Arc::clone(&client)));
    client.open_view().await?;

    let mut staged: Vec<PendingFile> = Vec::new();
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let outcome = match command {
            "/quit" => break,
            "/attach" => {
                for path in rest.split_whitespace() {
                    match PendingFile::from_path(PathBuf::from(path)).await {
                        Ok(file) => staged.push(file),
                        Err(err) => eprintln!("{err}"),
                    }
                }
                println!("{} file(s) staged; send a message or /send", staged.len());
                Ok(())
            }
            "/send" => client
                .send_message(None, std::mem::take(&mut staged))
                .await
                .map(|_| ()),
            "/edit" => match rest.split_once(' ') {
                Some((id, body)) => client
                    .edit_message(&MessageId::from(id), body)
                    .await
                    .map(|_| ()),
                None => {
                    println!("usage: /edit <id> <text>");
                    Ok(())
                }
            },
            "/delete" => client.delete_message(&MessageId::from(rest.trim())).await,
            "/older" => scroll_to_top(&client).await,
            "/latest" => {
                client.jump_to_latest().await;
                println!("-- latest --");
                Ok(())
            }
            "/who" => {
                for record in client.presence_records().await {
                    let status = if record.is_online { "online" } else { "offline" };
                    println!("user-{} {status}", record.user_id.0);
                }
                Ok(())
            }
            _ if command.starts_with('/') => {
                println!("{HELP}");
                Ok(())
            }
            _ => client
                .send_message(Some(line.to_string()), std::mem::take(&mut staged))
                .await
                .map(|_| ()),
        };
        if let Err(err) = outcome {
            eprintln!("{err}");
        }
    }

    client.close_view().await;
    Ok(())
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    let mut printed: HashMap<MessageId, Option<String>> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ClientEvent::TimelineChanged => {
                follow_content(&client).await;
                for message in client.visible_messages().await {
                    let version = message.edited_at.map(|at| at.to_rfc3339());
                    if printed.get(&message.id) != Some(&version) {
                        print_message(&message);
                        printed.insert(message.id.clone(), version);
                    }
                }
            }
            ClientEvent::TypingChanged { .. } => {
                let typing = client.typing_users().await;
                if !typing.is_empty() {
                    let names: Vec<String> = typing.iter().map(|u| format!("user-{}", u.0)).collect();
                    println!("... {} typing", names.join(", "));
                }
            }
            ClientEvent::NewMessage {
                action: ScrollAction::ShowJumpToLatest { unread },
                ..
            } => println!("{unread} new, /latest"),
            ClientEvent::NewMessage { .. } => {}
            ClientEvent::Connection(ConnectionState::Reconnecting) => println!("reconnecting..."),
            ClientEvent::Connection(_) | ClientEvent::PresenceChanged(_) => {}
            ClientEvent::UploadProgress { percent, .. } => println!("upload {percent}%"),
            ClientEvent::AttachmentFailed {
                filename, reason, ..
            } => eprintln!("attachment {filename} failed: {reason}"),
            ClientEvent::Error(err) => eprintln!("{err}"),
        }
    }
}

/// Moves the reader to the oldest cached row, which pulls in the previous
/// page when there is one.
async fn scroll_to_top(client: &ChatClient) -> client_core::ClientResult<()> {
    let before = client.visible_messages().await.len() as f64;
    match client.on_scroll(0.0, VIEW_ROWS, before).await? {
        Some(count) if count > 0 => {
            let after = client.visible_messages().await.len() as f64;
            client.anchor_after_prepend(before, after).await;
            println!("loaded {count} older message(s)");
        }
        _ => println!("no older messages"),
    }
    Ok(())
}

/// Keeps the viewport pinned to the newest row unless the reader scrolled up.
async fn follow_content(client: &ChatClient) {
    let rows = client.visible_messages().await.len() as f64;
    let scroll = client.scroll_state().await;
    let scroll_top = if scroll.is_near_bottom() {
        (rows - VIEW_ROWS).max(0.0)
    } else {
        scroll.scroll_top()
    };
    client.update_viewport(scroll_top, VIEW_ROWS, rows).await;
}

fn print_message(message: &Message) {
    let edited = if message.edited_at.is_some() { " (edited)" } else { "" };
    println!(
        "[{}] {}: {}{} <{}>",
        message.sent_at.format("%H:%M:%S"),
        message.author_display_name,
        message.body.as_deref().unwrap_or(""),
        edited,
        message.id
    );
    for attachment in &message.attachments {
        println!("    {} {}", attachment.filename, attachment.url);
    }
}
