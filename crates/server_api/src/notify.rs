use async_trait::async_trait;
use shared::{domain::UserId, protocol::Message};
use tracing::debug;

/// One-way hook towards the external notification dispatcher. Failures here
/// never affect message delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn message_for_offline_users(&self, message: &Message, recipients: &[UserId]);
}

pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn message_for_offline_users(&self, message: &Message, recipients: &[UserId]) {
        if recipients.is_empty() {
            return;
        }
        debug!(
            message_id = %message.id,
            recipients = recipients.len(),
            "new message for offline users"
        );
    }
}
