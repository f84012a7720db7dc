use std::sync::Arc;

use futures::StreamExt;
use shared::{domain::UserId, protocol::StreamFrame};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    ChatClient, ClientEvent, ConnectionState,
};

pub(crate) fn ws_url(server_url: &str, user_id: UserId) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|e| ClientError::Validation(format!("invalid server url {server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ClientError::Validation(format!(
                "server url must be http or https, got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Validation("cannot derive websocket url".to_string()))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", &user_id.0.to_string());
    Ok(url)
}

/// Keeps one push stream alive for as long as the view is open. Every
/// (re)connect is followed by a resync so missed events are recovered.
pub(crate) async fn run_push_stream(client: Arc<ChatClient>, url: Url) {
    let backoff = client.config.reconnect_backoff;
    let dead_after = client.config.keepalive_interval * 2;
    let mut first_attempt = true;

    loop {
        let state = if first_attempt {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        first_attempt = false;
        client.emit(ClientEvent::Connection(state));

        let mut ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!(%err, "push stream connect failed");
                client.emit(ClientEvent::Error(ClientError::Transport(err.to_string())));
                sleep(backoff).await;
                continue;
            }
        };
        info!(url = %url, "push stream connected");
        client.emit(ClientEvent::Connection(ConnectionState::Connected));

        if let Err(err) = client.resync().await {
            warn!(%err, "resync after connect failed");
            client.emit(ClientEvent::Error(err));
        }

        loop {
            let next = match timeout(dead_after, ws.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(?dead_after, "no frames received; treating link as dead");
                    break;
                }
            };
            match next {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<StreamFrame>(&text) {
                    Ok(StreamFrame::Event(event)) => client.apply_event(event).await,
                    Ok(StreamFrame::Keepalive { .. }) => debug!("keepalive"),
                    Err(err) => {
                        client.emit(ClientEvent::Error(ClientError::Server(format!(
                            "invalid stream frame: {err}"
                        ))));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "push stream read failed");
                    break;
                }
            }
        }

        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_http_scheme() {
        let url = ws_url("http://127.0.0.1:8443", UserId(7)).expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8443/ws?user_id=7");

        let url = ws_url("https://chat.example.com/", UserId(1)).expect("url");
        assert_eq!(url.as_str(), "wss://chat.example.com/ws?user_id=1");
    }

    #[test]
    fn websocket_url_rejects_other_schemes() {
        assert!(ws_url("ftp://example.com", UserId(1)).is_err());
        assert!(ws_url("not a url", UserId(1)).is_err());
    }
}
