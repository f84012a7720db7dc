use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{domain::UserId, protocol::StreamFrame};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Drives one push stream until the client leaves or the bus drops it.
pub(crate) async fn run_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let mut connection = state.api.bus.subscribe(user_id);
    let connection_id = connection.id().0;

    // The first tick fires immediately, so a fresh stream gets a frame at once.
    let mut keepalive = interval(state.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = connection.recv() => {
                let Some(event) = event else {
                    warn!(connection_id, user_id = user_id.0, "connection dropped by event bus");
                    break;
                };
                if send_frame(&mut sender, &StreamFrame::Event(event)).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                let frame = StreamFrame::Keepalive { sent_at: Utc::now() };
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(error)) => {
                    debug!(connection_id, %error, "stream read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    info!(connection_id, user_id = user_id.0, "stream closed");
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &StreamFrame,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "failed to encode stream frame");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await
}
