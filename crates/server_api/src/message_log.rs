use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use shared::{
    domain::{AttachmentId, MediaType, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        is_valid_filename, Attachment, Message, MessagePage, PageCursor, ServerEvent,
        DEFAULT_PAGE_LIMIT, MAX_ATTACHMENTS_PER_MESSAGE, MAX_ATTACHMENT_BYTES, MAX_BODY_CHARS,
        MAX_PAGE_LIMIT,
    },
};
use storage::{NewAttachment, NewMessage, Storage, StoredMessage};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{bus::EventBus, internal, notify::NotificationSink, presence::PresenceTracker};

const MAX_MESSAGE_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    /// `false` when the id was already known and the stored record was returned.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

pub struct MessageLog {
    storage: Storage,
    bus: Arc<EventBus>,
    presence: Arc<PresenceTracker>,
    notifier: Arc<dyn NotificationSink>,
    writer: Mutex<()>,
}

impl MessageLog {
    pub fn new(
        storage: Storage,
        bus: Arc<EventBus>,
        presence: Arc<PresenceTracker>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            storage,
            bus,
            presence,
            notifier,
            writer: Mutex::new(()),
        }
    }

    pub async fn append(
        &self,
        author_id: UserId,
        id: MessageId,
        body: Option<String>,
    ) -> Result<AppendOutcome, ApiError> {
        validate_message_id(&id)?;
        let body = normalize_body(body)?;

        let message = {
            let _writer = self.writer.lock().await;

            if let Some(existing) = self.storage.load_message(&id).await.map_err(internal)? {
                if existing.author_id != author_id {
                    return Err(ApiError::validation("message id already in use"));
                }
                debug!(message_id = %id, "duplicate submission; returning stored record");
                return Ok(AppendOutcome {
                    message: to_message(existing),
                    created: false,
                });
            }

            if body.is_none() {
                let pending = self
                    .storage
                    .count_pending_attachments(&id, author_id)
                    .await
                    .map_err(internal)?;
                if pending == 0 {
                    return Err(ApiError::validation(
                        "message needs text or at least one attachment",
                    ));
                }
            }

            let inserted = self
                .storage
                .insert_message(&NewMessage {
                    id: &id,
                    author_id,
                    body: body.as_deref(),
                    sent_at: now(),
                })
                .await
                .map_err(internal)?;
            let claimed = if inserted {
                self.storage
                    .claim_attachments(&id, author_id)
                    .await
                    .map_err(internal)?
            } else {
                0
            };

            let stored = self.load(&id).await?;
            let message = to_message(stored);
            if !inserted {
                return Ok(AppendOutcome {
                    message,
                    created: false,
                });
            }

            info!(
                message_id = %message.id,
                user_id = author_id.0,
                attachments = claimed,
                "message appended"
            );
            self.bus.publish(ServerEvent::MessageCreated {
                message: message.clone(),
            });
            message
        };

        let offline: Vec<UserId> = self
            .presence
            .snapshot()
            .into_iter()
            .filter(|record| !record.is_online && record.user_id != author_id)
            .map(|record| record.user_id)
            .collect();
        if !offline.is_empty() {
            self.notifier
                .message_for_offline_users(&message, &offline)
                .await;
        }

        Ok(AppendOutcome {
            message,
            created: true,
        })
    }

    pub async fn edit(
        &self,
        actor: UserId,
        id: &MessageId,
        body: String,
    ) -> Result<Message, ApiError> {
        let Some(body) = normalize_body(Some(body))? else {
            return Err(ApiError::validation("edited body must not be empty"));
        };

        let _writer = self.writer.lock().await;
        let stored = self.load_live(id).await?;
        if stored.author_id != actor {
            return Err(ApiError::forbidden("only the author may edit a message"));
        }
        if !self
            .storage
            .update_message_body(id, &body, now())
            .await
            .map_err(internal)?
        {
            return Err(ApiError::not_found("message not found"));
        }

        let message = to_message(self.load(id).await?);
        info!(message_id = %id, user_id = actor.0, "message edited");
        self.bus.publish(ServerEvent::MessageEdited {
            message: message.clone(),
        });
        Ok(message)
    }

    pub async fn delete(&self, actor: UserId, id: &MessageId) -> Result<(), ApiError> {
        let _writer = self.writer.lock().await;
        let stored = self.load_live(id).await?;
        if stored.author_id != actor {
            return Err(ApiError::forbidden("only the author may delete a message"));
        }
        if !self.storage.tombstone_message(id).await.map_err(internal)? {
            return Err(ApiError::not_found("message not found"));
        }

        info!(message_id = %id, user_id = actor.0, "message deleted");
        self.bus
            .publish(ServerEvent::MessageDeleted { id: id.clone() });
        Ok(())
    }

    /// Non-deleted messages strictly older than `before`, newest first.
    pub async fn page(
        &self,
        before: Option<PageCursor>,
        limit: Option<u32>,
    ) -> Result<MessagePage, ApiError> {
        let limit = clamp_limit(limit);
        let before = before.as_ref().map(|cursor| (cursor.sent_at, &cursor.id));
        let mut rows = self
            .storage
            .page_messages(before, limit + 1)
            .await
            .map_err(internal)?;

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        Ok(MessagePage {
            messages: rows.into_iter().map(to_message).collect(),
            has_more,
        })
    }

    /// Includes tombstoned records.
    pub async fn get(&self, id: &MessageId) -> Result<Option<Message>, ApiError> {
        Ok(self
            .storage
            .load_message(id)
            .await
            .map_err(internal)?
            .map(to_message))
    }

    /// Drops uploads that no message claimed within `ttl`. Runs under the
    /// writer lock so it never races a claim.
    pub async fn purge_unclaimed(
        &self,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Result<u64, ApiError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| internal(e.into()))?;
        let _guard = self.writer.lock().await;
        let purged = self
            .storage
            .purge_unclaimed_attachments(now - ttl)
            .await
            .map_err(internal)?;
        if purged > 0 {
            info!(purged, "purged unclaimed attachments");
        }
        Ok(purged)
    }

    /// Stores a finished upload batch. If the owning message already exists
    /// the files are merged onto it and the full record is republished.
    pub async fn attach_uploaded(
        &self,
        uploader_id: UserId,
        pending_message_id: &MessageId,
        files: Vec<UploadedFile>,
    ) -> Result<Vec<Attachment>, ApiError> {
        validate_message_id(pending_message_id)?;
        validate_batch(&files)?;

        let _writer = self.writer.lock().await;
        let already_pending = self
            .storage
            .count_pending_attachments(pending_message_id, uploader_id)
            .await
            .map_err(internal)?;
        if already_pending as usize + files.len() > MAX_ATTACHMENTS_PER_MESSAGE {
            return Err(ApiError::validation(format!(
                "at most {MAX_ATTACHMENTS_PER_MESSAGE} attachments per message"
            )));
        }

        let mut stored = Vec::with_capacity(files.len());
        for file in &files {
            let media_type = MediaType::infer(&file.filename, file.content_type.as_deref());
            let content_type = file
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let id = self
                .storage
                .store_attachment(&NewAttachment {
                    uploader_id,
                    pending_message_id,
                    filename: &file.filename,
                    media_type,
                    content_type: &content_type,
                    data: &file.data,
                })
                .await
                .map_err(internal)?;
            stored.push(Attachment {
                id,
                filename: file.filename.clone(),
                url: attachment_url(id),
                media_type,
                size_bytes: file.data.len() as u64,
            });
        }

        let existing = self
            .storage
            .load_message(pending_message_id)
            .await
            .map_err(internal)?;
        if let Some(existing) = existing {
            if !existing.deleted && existing.author_id == uploader_id {
                self.storage
                    .claim_attachments(pending_message_id, uploader_id)
                    .await
                    .map_err(internal)?;
                let message = to_message(self.load(pending_message_id).await?);
                info!(
                    message_id = %pending_message_id,
                    attachments = stored.len(),
                    "late attachments merged"
                );
                self.bus.publish(ServerEvent::MessageEdited { message });
            }
        }

        Ok(stored)
    }

    async fn load(&self, id: &MessageId) -> Result<StoredMessage, ApiError> {
        self.storage
            .load_message(id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found("message not found"))
    }

    async fn load_live(&self, id: &MessageId) -> Result<StoredMessage, ApiError> {
        match self.load(id).await? {
            stored if stored.deleted => Err(ApiError::not_found("message not found")),
            stored => Ok(stored),
        }
    }
}

pub fn attachment_url(id: AttachmentId) -> String {
    format!("/attachments/{}", id.0)
}

pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

pub fn to_message(stored: StoredMessage) -> Message {
    let author_display_name = stored
        .author_username
        .unwrap_or_else(|| format!("user-{}", stored.author_id.0));
    Message {
        id: stored.id,
        author_id: stored.author_id,
        author_display_name,
        body: stored.body,
        attachments: stored
            .attachments
            .into_iter()
            .map(|a| Attachment {
                id: a.attachment_id,
                filename: a.filename,
                url: attachment_url(a.attachment_id),
                media_type: a.media_type,
                size_bytes: a.size_bytes,
            })
            .collect(),
        sent_at: stored.sent_at,
        edited_at: stored.edited_at,
        deleted: stored.deleted,
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn validate_message_id(id: &MessageId) -> Result<(), ApiError> {
    let raw = id.as_str();
    if raw.is_empty() || raw.len() > MAX_MESSAGE_ID_LEN {
        return Err(ApiError::validation("message id must be 1-128 bytes"));
    }
    if raw.chars().any(char::is_control) {
        return Err(ApiError::validation("message id contains control characters"));
    }
    Ok(())
}

fn normalize_body(body: Option<String>) -> Result<Option<String>, ApiError> {
    let Some(body) = body else {
        return Ok(None);
    };
    if body.trim().is_empty() {
        return Ok(None);
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("message body exceeds {MAX_BODY_CHARS} characters"),
        ));
    }
    Ok(Some(body))
}

fn validate_batch(files: &[UploadedFile]) -> Result<(), ApiError> {
    if files.is_empty() {
        return Err(ApiError::validation("no files in upload"));
    }
    if files.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(ApiError::validation(format!(
            "at most {MAX_ATTACHMENTS_PER_MESSAGE} attachments per message"
        )));
    }
    for file in files {
        if !is_valid_filename(&file.filename) {
            return Err(ApiError::validation(format!(
                "invalid attachment filename: {}",
                file.filename
            )));
        }
        if file.data.is_empty() {
            return Err(ApiError::validation(format!("{} is empty", file.filename)));
        }
        if file.data.len() > MAX_ATTACHMENT_BYTES {
            return Err(ApiError::new(
                ErrorCode::PayloadTooLarge,
                format!("{} exceeds the 10 MB attachment limit", file.filename),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
