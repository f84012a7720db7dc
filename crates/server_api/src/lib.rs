pub mod bus;
pub mod message_log;
pub mod notify;
pub mod presence;

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{PresenceStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{LoginResponse, PresenceRecord},
};
use storage::Storage;
use tracing::info;

use crate::{
    bus::EventBus,
    message_log::MessageLog,
    notify::{LoggingNotificationSink, NotificationSink},
    presence::{PresenceConfig, PresenceTracker},
};

const MAX_USERNAME_CHARS: usize = 64;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub bus: Arc<EventBus>,
    pub presence: Arc<PresenceTracker>,
    pub messages: Arc<MessageLog>,
}

impl ApiContext {
    pub fn new(storage: Storage, presence: PresenceConfig, queue_capacity: usize) -> Self {
        Self::with_notifier(
            storage,
            presence,
            queue_capacity,
            Arc::new(LoggingNotificationSink),
        )
    }

    pub fn with_notifier(
        storage: Storage,
        presence: PresenceConfig,
        queue_capacity: usize,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(queue_capacity));
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&bus), presence));
        let messages = Arc::new(MessageLog::new(
            storage.clone(),
            Arc::clone(&bus),
            Arc::clone(&presence),
            notifier,
        ));
        Self {
            storage,
            bus,
            presence,
            messages,
        }
    }
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<LoginResponse, ApiError> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::validation("username must be 1-64 characters"));
    }
    let user_id = ctx.storage.create_user(username).await.map_err(internal)?;
    info!(user_id = user_id.0, "user logged in");
    Ok(LoginResponse {
        user_id,
        display_name: username.to_string(),
    })
}

/// Stand-in for session validation: the caller-supplied id must belong to a
/// registered user.
pub async fn ensure_known_user(ctx: &ApiContext, user_id: UserId) -> Result<String, ApiError> {
    ctx.storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "unknown user"))
}

pub async fn set_presence(
    ctx: &ApiContext,
    user_id: UserId,
    status: PresenceStatus,
) -> Result<(), ApiError> {
    ensure_known_user(ctx, user_id).await?;
    match status {
        PresenceStatus::Online => ctx.presence.heartbeat(user_id, Utc::now()),
        PresenceStatus::Offline => ctx.presence.go_offline(user_id, Utc::now()),
    }
    Ok(())
}

pub async fn set_typing(ctx: &ApiContext, user_id: UserId, typing: bool) -> Result<(), ApiError> {
    ensure_known_user(ctx, user_id).await?;
    ctx.presence.set_typing(user_id, typing, Utc::now());
    Ok(())
}

pub fn presence_snapshot(ctx: &ApiContext) -> Vec<PresenceRecord> {
    ctx.presence.snapshot()
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
