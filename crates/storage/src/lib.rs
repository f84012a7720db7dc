use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{AttachmentId, MediaType, MessageId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_username: Option<String>,
    pub body: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub attachments: Vec<StoredAttachment>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub filename: String,
    pub media_type: MediaType,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StoredAttachmentBlob {
    pub attachment_id: AttachmentId,
    pub pending_message_id: MessageId,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub id: &'a MessageId,
    pub author_id: UserId,
    pub body: Option<&'a str>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment<'a> {
    pub uploader_id: UserId,
    pub pending_message_id: &'a MessageId,
    pub filename: &'a str,
    pub media_type: MediaType,
    pub content_type: &'a str,
    pub data: &'a [u8],
}

const MESSAGE_COLUMNS: &str = "m.id, m.author_id, u.username, m.body, m.sent_at_us, m.edited_at_us, m.deleted";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every in-memory connection is a separate database.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert user")?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load username")?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Returns `false` when a message with the same id already exists.
    pub async fn insert_message(&self, message: &NewMessage<'_>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages (id, author_id, body, sent_at_us) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(message.id.as_str())
        .bind(message.author_id.0)
        .bind(message.body)
        .bind(message.sent_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert message {}", message.id))?;
        Ok(result.rows_affected() == 1)
    }

    /// Loads a message regardless of its tombstone flag.
    pub async fn load_message(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.author_id
             WHERE m.id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load message {id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row);
        message.attachments = self.attachments_for_message(&message.id).await?;
        Ok(Some(message))
    }

    pub async fn update_message_body(
        &self,
        id: &MessageId,
        body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET body = ?, edited_at_us = ? WHERE id = ? AND deleted = 0",
        )
        .bind(body)
        .bind(edited_at.timestamp_micros())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to edit message {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn tombstone_message(&self, id: &MessageId) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ? AND deleted = 0")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to tombstone message {id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Non-deleted messages strictly older than `before` under the
    /// `(sent_at, id)` order, newest first.
    pub async fn page_messages(
        &self,
        before: Option<(DateTime<Utc>, &MessageId)>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some((sent_at, id)) = before {
            let sent_at_us = sent_at.timestamp_micros();
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 LEFT JOIN users u ON u.id = m.author_id
                 WHERE m.deleted = 0
                   AND (m.sent_at_us < ? OR (m.sent_at_us = ? AND m.id < ?))
                 ORDER BY m.sent_at_us DESC, m.id DESC
                 LIMIT ?"
            ))
            .bind(sent_at_us)
            .bind(sent_at_us)
            .bind(id.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 LEFT JOIN users u ON u.id = m.author_id
                 WHERE m.deleted = 0
                 ORDER BY m.sent_at_us DESC, m.id DESC
                 LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .context("failed to page messages")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = message_from_row(&row);
            message.attachments = self.attachments_for_message(&message.id).await?;
            messages.push(message);
        }
        Ok(messages)
    }

    pub async fn count_tombstones(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE deleted = 1")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tombstones")
    }

    pub async fn store_attachment(&self, attachment: &NewAttachment<'_>) -> Result<AttachmentId> {
        let size_bytes = i64::try_from(attachment.data.len()).unwrap_or(i64::MAX);
        let rec = sqlx::query(
            "INSERT INTO attachments (pending_message_id, uploader_id, filename, media_type, content_type, size_bytes, data, created_at_us)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(attachment.pending_message_id.as_str())
        .bind(attachment.uploader_id.0)
        .bind(attachment.filename)
        .bind(attachment.media_type.as_str())
        .bind(attachment.content_type)
        .bind(size_bytes)
        .bind(attachment.data)
        .bind(Utc::now().timestamp_micros())
        .fetch_one(&self.pool)
        .await
        .context("failed to store attachment")?;
        Ok(AttachmentId(rec.get::<i64, _>(0)))
    }

    /// Deletes uploads that were never bound to a message and were stored
    /// before `cutoff`.
    pub async fn purge_unclaimed_attachments(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM attachments WHERE message_id IS NULL AND created_at_us < ?",
        )
        .bind(cutoff.timestamp_micros())
        .execute(&self.pool)
        .await
        .context("failed to purge unclaimed attachments")?;
        Ok(result.rows_affected())
    }

    pub async fn count_pending_attachments(
        &self,
        pending_message_id: &MessageId,
        uploader_id: UserId,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM attachments
             WHERE pending_message_id = ? AND uploader_id = ? AND message_id IS NULL",
        )
        .bind(pending_message_id.as_str())
        .bind(uploader_id.0)
        .fetch_one(&self.pool)
        .await
        .context("failed to count pending attachments")
    }

    /// Binds unowned uploads made under `message_id` by its author.
    pub async fn claim_attachments(&self, message_id: &MessageId, author_id: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE attachments SET message_id = pending_message_id
             WHERE pending_message_id = ? AND uploader_id = ? AND message_id IS NULL",
        )
        .bind(message_id.as_str())
        .bind(author_id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to claim attachments for {message_id}"))?;
        Ok(result.rows_affected())
    }

    pub async fn attachments_for_message(&self, message_id: &MessageId) -> Result<Vec<StoredAttachment>> {
        let rows = sqlx::query(
            "SELECT id, filename, media_type, size_bytes FROM attachments
             WHERE message_id = ? ORDER BY id ASC",
        )
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load attachments for {message_id}"))?;
        Ok(rows
            .into_iter()
            .map(|r| StoredAttachment {
                attachment_id: AttachmentId(r.get::<i64, _>(0)),
                filename: r.get::<String, _>(1),
                media_type: MediaType::parse(&r.get::<String, _>(2)),
                size_bytes: r.get::<i64, _>(3).max(0) as u64,
            })
            .collect())
    }

    pub async fn load_attachment_blob(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<Option<StoredAttachmentBlob>> {
        let row = sqlx::query(
            "SELECT id, pending_message_id, filename, content_type, data FROM attachments WHERE id = ?",
        )
        .bind(attachment_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load attachment")?;
        Ok(row.map(|r| StoredAttachmentBlob {
            attachment_id: AttachmentId(r.get::<i64, _>(0)),
            pending_message_id: MessageId(r.get::<String, _>(1)),
            filename: r.get::<String, _>(2),
            content_type: r.get::<String, _>(3),
            data: r.get::<Vec<u8>, _>(4),
        }))
    }
}

fn message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        id: MessageId(r.get::<String, _>(0)),
        author_id: UserId(r.get::<i64, _>(1)),
        author_username: r.get::<Option<String>, _>(2),
        body: r.get::<Option<String>, _>(3),
        sent_at: from_micros(r.get::<i64, _>(4)),
        edited_at: r.get::<Option<i64>, _>(5).map(from_micros),
        deleted: r.get::<bool, _>(6),
        attachments: Vec::new(),
    }
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
