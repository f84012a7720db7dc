use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use server_api::{
    ensure_known_user, login as api_login,
    message_log::{MessageLog, UploadedFile},
    presence::PresenceTracker,
    presence_snapshot, set_presence, set_typing, ApiContext,
};
use shared::{
    domain::{AttachmentId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        Attachment, EditMessageRequest, LoginRequest, LoginResponse, Message, MessagePage,
        PageCursor, PresenceRecord, PresenceRequest, SendMessageRequest, TypingRequest,
        MAX_ATTACHMENTS_PER_MESSAGE, MAX_ATTACHMENT_BYTES,
    },
};
use storage::Storage;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod stream;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

const ATTACHMENT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    before_sent_at: Option<DateTime<Utc>>,
    before_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    user_id: i64,
    pending_message_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(
        storage,
        settings.presence_config(),
        settings.connection_queue_capacity,
    );
    let sweeper = spawn_presence_sweeper(Arc::clone(&api.presence), settings.sweep_interval);
    let janitor = spawn_attachment_janitor(
        Arc::clone(&api.messages),
        settings.unclaimed_attachment_ttl,
    );

    let state = AppState {
        api,
        keepalive_interval: settings.keepalive_interval,
    };
    let app = build_router(Arc::new(state), settings.max_upload_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(
        %addr,
        heartbeat_secs = settings.heartbeat_interval.as_secs(),
        keepalive_secs = settings.keepalive_interval.as_secs(),
        "server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app).await;
    sweeper.abort();
    janitor.abort();
    served?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/messages", get(http_list_messages).post(http_send_message))
        .route(
            "/messages/:message_id",
            patch(http_edit_message).delete(http_delete_message),
        )
        .route("/presence", get(http_presence_snapshot).post(http_set_presence))
        .route("/typing", post(http_set_typing))
        .route("/attachments", post(upload_attachments))
        .route("/attachments/:attachment_id", get(download_attachment))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .with_state(state)
}

fn spawn_presence_sweeper(presence: Arc<PresenceTracker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            presence.sweep(Utc::now());
        }
    })
}

/// Uploads whose message never arrived are dropped once they outlive `ttl`.
fn spawn_attachment_janitor(messages: Arc<MessageLog>, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ATTACHMENT_PURGE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = messages.purge_unclaimed(Utc::now(), ttl).await {
                warn!(error = %err, "attachment purge failed");
            }
        }
    })
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if err.code == ErrorCode::Internal {
        error!(error = %err, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    debug!(connections = state.api.bus.connection_count(), "health check");
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> HttpResult<Json<LoginResponse>> {
    let response = api_login(&state.api, &req.username).await.map_err(reject)?;
    Ok(Json(response))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Json<MessagePage>> {
    ensure_known_user(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    let before = match (q.before_sent_at, q.before_id) {
        (Some(sent_at), Some(id)) => Some(PageCursor {
            sent_at,
            id: MessageId(id),
        }),
        (None, None) => None,
        _ => {
            return Err(reject(ApiError::validation(
                "before_sent_at and before_id must be given together",
            )))
        }
    };
    let page = state
        .api
        .messages
        .page(before, q.limit)
        .await
        .map_err(reject)?;
    Ok(Json(page))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<(StatusCode, Json<Message>)> {
    ensure_known_user(&state.api, req.user_id)
        .await
        .map_err(reject)?;
    let outcome = state
        .api
        .messages
        .append(req.user_id, req.id, req.body)
        .await
        .map_err(reject)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.message)))
}

async fn http_edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> HttpResult<Json<Message>> {
    ensure_known_user(&state.api, req.user_id)
        .await
        .map_err(reject)?;
    let message = state
        .api
        .messages
        .edit(req.user_id, &MessageId(message_id), req.body)
        .await
        .map_err(reject)?;
    Ok(Json(message))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> HttpResult<StatusCode> {
    let user_id = UserId(q.user_id);
    ensure_known_user(&state.api, user_id)
        .await
        .map_err(reject)?;
    state
        .api
        .messages
        .delete(user_id, &MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_set_presence(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresenceRequest>,
) -> HttpResult<StatusCode> {
    set_presence(&state.api, req.user_id, req.status)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_presence_snapshot(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<PresenceRecord>> {
    Json(presence_snapshot(&state.api))
}

async fn http_set_typing(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TypingRequest>,
) -> HttpResult<StatusCode> {
    set_typing(&state.api, req.user_id, req.typing)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_attachments(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> HttpResult<Json<Vec<Attachment>>> {
    let user_id = UserId(q.user_id);
    ensure_known_user(&state.api, user_id)
        .await
        .map_err(reject)?;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| reject(ApiError::validation(e.to_string())))?
    {
        if files.len() == MAX_ATTACHMENTS_PER_MESSAGE {
            return Err(reject(ApiError::validation(format!(
                "at most {MAX_ATTACHMENTS_PER_MESSAGE} attachments per message"
            ))));
        }
        let filename = field
            .file_name()
            .or_else(|| field.name())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let content_type = field
            .content_type()
            .map(str::to_string)
            .filter(|ct| !ct.trim().is_empty());
        let data = field
            .bytes()
            .await
            .map_err(|e| reject(ApiError::validation(e.to_string())))?;
        if data.len() > MAX_ATTACHMENT_BYTES {
            return Err(reject(ApiError::new(
                ErrorCode::PayloadTooLarge,
                format!("{filename} exceeds the 10 MB attachment limit"),
            )));
        }
        files.push(UploadedFile {
            filename,
            content_type,
            data: data.to_vec(),
        });
    }

    let attachments = state
        .api
        .messages
        .attach_uploaded(user_id, &MessageId(q.pending_message_id), files)
        .await
        .map_err(reject)?;
    Ok(Json(attachments))
}

async fn download_attachment(
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<i64>,
) -> HttpResult<impl IntoResponse> {
    let blob = state
        .api
        .storage
        .load_attachment_blob(AttachmentId(attachment_id))
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?
        .ok_or_else(|| reject(ApiError::not_found("attachment not found")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&blob.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&blob.filename),
    );

    Ok((StatusCode::OK, headers, blob.data))
}

/// Header values must be visible ASCII; anything else in the stored name is
/// replaced so the header is never dropped.
fn content_disposition(filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<impl IntoResponse> {
    let user_id = UserId(q.user_id);
    ensure_known_user(&state.api, user_id)
        .await
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| stream::run_connection(state, socket, user_id)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
