use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::domain::MessageId;
use storage::{StoredMessage, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the latest visible messages, oldest first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Prints one message, including tombstones.
    Show { message_id: String },
    Tombstones,
    /// Deletes uploaded attachments no message ever claimed.
    PurgeAttachments {
        #[arg(long, default_value_t = 60)]
        older_than_mins: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::History { limit } => {
            let mut messages = storage.page_messages(None, limit).await?;
            messages.reverse();
            for message in &messages {
                print_message(message);
            }
        }
        Command::Show { message_id } => {
            let id = MessageId(message_id);
            let Some(message) = storage.load_message(&id).await? else {
                bail!("message {id} not found");
            };
            print_message(&message);
            for attachment in &message.attachments {
                println!(
                    "    attachment_id={} {} ({}, {} bytes)",
                    attachment.attachment_id.0,
                    attachment.filename,
                    attachment.media_type.as_str(),
                    attachment.size_bytes
                );
            }
        }
        Command::Tombstones => {
            println!("tombstones={}", storage.count_tombstones().await?);
        }
        Command::PurgeAttachments { older_than_mins } => {
            let cutoff = Utc::now() - chrono::Duration::minutes(older_than_mins);
            let purged = storage.purge_unclaimed_attachments(cutoff).await?;
            println!("purged={purged}");
        }
    }

    Ok(())
}

fn print_message(message: &StoredMessage) {
    let author = message
        .author_username
        .clone()
        .unwrap_or_else(|| format!("user-{}", message.author_id.0));
    let mut flags = String::new();
    if message.edited_at.is_some() {
        flags.push_str(" (edited)");
    }
    if message.deleted {
        flags.push_str(" (deleted)");
    }
    println!(
        "{} {} [{}] {}{} +{} attachment(s)",
        message.sent_at.to_rfc3339(),
        message.id,
        author,
        message.body.as_deref().unwrap_or(""),
        flags,
        message.attachments.len()
    );
}
