use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{MessageId, PresenceStatus, TypingState, UserId},
    error::ApiError,
    protocol::{
        Attachment, EditMessageRequest, LoginRequest, LoginResponse, Message, MessagePage,
        PageCursor, PresenceRecord, PresenceRequest, SendMessageRequest, ServerEvent,
        TypingRequest, DEFAULT_PAGE_LIMIT, MAX_BODY_CHARS,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod attachments;
pub mod error;
pub mod presence;
pub mod scroll;
mod stream;
pub mod timeline;

pub use error::{ClientError, ClientResult};

use attachments::{prepare_file, upload_form, validate_batch, PendingFile, PreparedFile};
use presence::{
    spawn_heartbeat, PresenceSignals, PresenceView, TypingController, DEFAULT_TYPING_DEBOUNCE,
    DEFAULT_TYPING_TIMEOUT,
};
use scroll::{ScrollAction, ScrollState, DEFAULT_BOTTOM_THRESHOLD_PX, DEFAULT_TOP_THRESHOLD_PX};
use timeline::{Ingested, Timeline, Withdrawal};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub heartbeat_interval: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_backoff: Duration,
    pub typing_debounce: Duration,
    pub typing_timeout: Duration,
    pub page_size: u32,
    pub send_attempts: u32,
    pub retry_delay: Duration,
    pub scroll_bottom_threshold: f64,
    pub scroll_top_threshold: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".to_string(),
            heartbeat_interval: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(5),
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            page_size: DEFAULT_PAGE_LIMIT,
            send_attempts: 3,
            retry_delay: Duration::from_millis(500),
            scroll_bottom_threshold: DEFAULT_BOTTOM_THRESHOLD_PX,
            scroll_top_threshold: DEFAULT_TOP_THRESHOLD_PX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    TimelineChanged,
    /// A message appeared at the live end; `action` says whether the list
    /// should follow it or offer a jump to latest.
    NewMessage {
        id: MessageId,
        action: ScrollAction,
    },
    PresenceChanged(PresenceRecord),
    TypingChanged {
        user_id: UserId,
        typing_state: TypingState,
    },
    Connection(ConnectionState),
    UploadProgress {
        pending_message_id: MessageId,
        percent: u8,
    },
    AttachmentFailed {
        pending_message_id: MessageId,
        filename: String,
        reason: String,
    },
    Error(ClientError),
}

pub struct ChatClient {
    http: Client,
    config: ClientConfig,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct ClientState {
    user_id: Option<UserId>,
    display_name: Option<String>,
    timeline: Timeline,
    presence: PresenceView,
    loading_older: bool,
    scroll: ScrollState,
    view: Option<ActiveView>,
}

struct ActiveView {
    stream_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    typing: TypingController,
}

struct HttpSignals {
    http: Client,
    server_url: String,
    user_id: UserId,
}

#[async_trait]
impl PresenceSignals for HttpSignals {
    async fn send_presence(&self, status: PresenceStatus) -> ClientResult<()> {
        post_json(
            &self.http,
            &endpoint(&self.server_url, "/presence"),
            &PresenceRequest {
                user_id: self.user_id,
                status,
            },
        )
        .await?;
        Ok(())
    }

    async fn send_typing(&self, typing: bool) -> ClientResult<()> {
        post_json(
            &self.http,
            &endpoint(&self.server_url, "/typing"),
            &TypingRequest {
                user_id: self.user_id,
                typing,
            },
        )
        .await?;
        Ok(())
    }
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let scroll = ScrollState::new(config.scroll_bottom_threshold, config.scroll_top_threshold);
        Arc::new(Self {
            http: Client::new(),
            config,
            inner: Mutex::new(ClientState {
                scroll,
                ..ClientState::default()
            }),
            events,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn login(&self, username: &str) -> ClientResult<LoginResponse> {
        let response: LoginResponse = post_json(
            &self.http,
            &self.url("/login"),
            &LoginRequest {
                username: username.to_string(),
            },
        )
        .await?
        .json()
        .await?;

        let mut inner = self.inner.lock().await;
        inner.user_id = Some(response.user_id);
        inner.display_name = Some(response.display_name.clone());
        info!(user_id = response.user_id.0, "logged in");
        Ok(response)
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    async fn session(&self) -> ClientResult<(UserId, String)> {
        let inner = self.inner.lock().await;
        let user_id = inner.user_id.ok_or_else(ClientError::not_logged_in)?;
        let display_name = inner
            .display_name
            .clone()
            .unwrap_or_else(|| format!("user-{}", user_id.0));
        Ok((user_id, display_name))
    }

    fn url(&self, path: &str) -> String {
        endpoint(&self.config.server_url, path)
    }

    /// Starts the push stream, heartbeat and typing proxy for the channel view.
    pub async fn open_view(self: &Arc<Self>) -> ClientResult<()> {
        let (user_id, _) = self.session().await?;
        let ws_url = stream::ws_url(&self.config.server_url, user_id)?;
        {
            let mut inner = self.inner.lock().await;
            if inner.view.is_some() {
                return Ok(());
            }
            let signals: Arc<dyn PresenceSignals> = Arc::new(HttpSignals {
                http: self.http.clone(),
                server_url: self.config.server_url.clone(),
                user_id,
            });
            let heartbeat_task =
                spawn_heartbeat(Arc::clone(&signals), self.config.heartbeat_interval);
            let typing = TypingController::new(
                signals,
                self.config.typing_debounce,
                self.config.typing_timeout,
            );
            let stream_task = tokio::spawn(stream::run_push_stream(Arc::clone(self), ws_url));
            inner.view = Some(ActiveView {
                stream_task,
                heartbeat_task,
                typing,
            });
        }

        if let Err(err) = self.fetch_presence().await {
            warn!(%err, "initial presence fetch failed");
        }
        Ok(())
    }

    /// Tears down every task owned by the view. The offline signal is best
    /// effort; the server's liveness timeout covers a lost one.
    pub async fn close_view(&self) {
        let view = self.inner.lock().await.view.take();
        let Some(view) = view else {
            return;
        };
        view.stream_task.abort();
        view.heartbeat_task.abort();
        view.typing.stop().await;
        if let Err(err) = self.set_presence(PresenceStatus::Offline).await {
            debug!(%err, "offline signal not delivered");
        }
    }

    pub async fn is_view_open(&self) -> bool {
        self.inner.lock().await.view.is_some()
    }

    /// Replaces the cache with the latest page. Safe to call at any time.
    pub async fn resync(&self) -> ClientResult<()> {
        let page = self.fetch_page(None).await?;
        self.inner.lock().await.timeline.reset_with_latest(&page);
        self.emit(ClientEvent::TimelineChanged);
        Ok(())
    }

    /// Fetches the page before the oldest cached message. Returns how many
    /// messages were added; zero if a request is already running or history is
    /// exhausted.
    pub async fn load_older(&self) -> ClientResult<usize> {
        let (cursor, generation) = {
            let mut inner = self.inner.lock().await;
            if inner.loading_older || !inner.timeline.has_more() {
                return Ok(0);
            }
            let Some(cursor) = inner.timeline.oldest_cursor() else {
                return Ok(0);
            };
            inner.loading_older = true;
            (cursor, inner.timeline.generation())
        };

        let result = self.fetch_page(Some(&cursor)).await;
        let mut inner = self.inner.lock().await;
        inner.loading_older = false;
        let inserted = inner
            .timeline
            .merge_older(&result?, generation)
            .unwrap_or(0);
        drop(inner);
        if inserted > 0 {
            self.emit(ClientEvent::TimelineChanged);
        }
        Ok(inserted)
    }

    /// Records where the renderer's message list is scrolled to.
    pub async fn update_viewport(&self, scroll_top: f64, viewport_height: f64, content_height: f64) {
        self.inner
            .lock()
            .await
            .scroll
            .update_viewport(scroll_top, viewport_height, content_height);
    }

    /// Loads older history when the reader has scrolled near the top.
    /// Returns `None` when no request was needed.
    pub async fn on_scroll(
        &self,
        scroll_top: f64,
        viewport_height: f64,
        content_height: f64,
    ) -> ClientResult<Option<usize>> {
        let wanted = {
            let mut inner = self.inner.lock().await;
            inner
                .scroll
                .update_viewport(scroll_top, viewport_height, content_height);
            inner
                .scroll
                .should_load_older(inner.timeline.has_more(), inner.loading_older)
        };
        if !wanted {
            return Ok(None);
        }
        self.load_older().await.map(Some)
    }

    /// Keeps the reader's place after older messages were prepended.
    /// Returns the scroll offset to apply.
    pub async fn anchor_after_prepend(&self, old_content_height: f64, new_content_height: f64) -> f64 {
        self.inner
            .lock()
            .await
            .scroll
            .anchor_after_prepend(old_content_height, new_content_height)
    }

    /// Clears the unread count. Returns the scroll offset that shows the
    /// newest message.
    pub async fn jump_to_latest(&self) -> f64 {
        self.inner.lock().await.scroll.jump_to_latest()
    }

    pub async fn scroll_state(&self) -> ScrollState {
        self.inner.lock().await.scroll.clone()
    }

    pub async fn is_loading_older(&self) -> bool {
        self.inner.lock().await.loading_older
    }

    pub async fn fetch_page(&self, before: Option<&PageCursor>) -> ClientResult<MessagePage> {
        let (user_id, _) = self.session().await?;
        let mut query = vec![
            ("user_id", user_id.0.to_string()),
            ("limit", self.config.page_size.to_string()),
        ];
        if let Some(cursor) = before {
            query.push((
                "before_sent_at",
                cursor.sent_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
            query.push(("before_id", cursor.id.to_string()));
        }
        let response = self
            .http
            .get(self.url("/messages"))
            .query(&query)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Shows the message at once, then delivers it. Text and attachments
    /// travel independently so a slow upload never holds back the text.
    pub async fn send_message(
        &self,
        body: Option<String>,
        files: Vec<PendingFile>,
    ) -> ClientResult<Message> {
        let (user_id, display_name) = self.session().await?;
        let body = body.filter(|b| !b.trim().is_empty());
        if body.is_none() && files.is_empty() {
            return Err(ClientError::Validation("nothing to send".to_string()));
        }
        if body
            .as_ref()
            .is_some_and(|b| b.chars().count() > MAX_BODY_CHARS)
        {
            return Err(ClientError::Validation(format!(
                "message is longer than {MAX_BODY_CHARS} characters"
            )));
        }
        validate_batch(&files)?;
        self.stop_typing().await;

        let id = MessageId::generate();
        let action = {
            let mut inner = self.inner.lock().await;
            inner.timeline.insert_optimistic(Message {
                id: id.clone(),
                author_id: user_id,
                author_display_name: display_name,
                body: body.clone(),
                attachments: Vec::new(),
                sent_at: Utc::now(),
                edited_at: None,
                deleted: false,
            });
            inner.scroll.on_new_message(true)
        };
        self.emit(ClientEvent::TimelineChanged);
        self.emit(ClientEvent::NewMessage {
            id: id.clone(),
            action,
        });

        if files.is_empty() {
            return self.deliver(user_id, id, body).await;
        }

        let filenames: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();
        let prepared = match tokio::task::spawn_blocking(move || {
            files.into_iter().map(prepare_file).collect::<Vec<_>>()
        })
        .await
        {
            Ok(prepared) => prepared,
            Err(err) => {
                self.withdraw(&id).await;
                return Err(ClientError::Validation(format!(
                    "failed to prepare attachments: {err}"
                )));
            }
        };

        if body.is_none() {
            return match self.upload_attachments(user_id, &id, prepared).await {
                Ok(_) => self.deliver(user_id, id, None).await,
                Err(err) => {
                    self.withdraw(&id).await;
                    self.report_failed_files(&id, &filenames, &err);
                    Err(ClientError::PartialFailure {
                        failed_files: filenames,
                        reason: err.to_string(),
                    })
                }
            };
        }

        let (sent, uploaded) = tokio::join!(
            self.deliver(user_id, id.clone(), body),
            self.upload_attachments(user_id, &id, prepared)
        );
        let message = sent?;
        match uploaded {
            Ok(attachments) => {
                let merged = {
                    let mut inner = self.inner.lock().await;
                    inner.timeline.merge_attachments(&id, &attachments);
                    inner.timeline.get(&id).cloned()
                };
                self.emit(ClientEvent::TimelineChanged);
                Ok(merged.unwrap_or(message))
            }
            Err(err) => {
                self.report_failed_files(&id, &filenames, &err);
                Ok(message)
            }
        }
    }

    /// Posts with the same id until it is accepted or a non-transport error
    /// comes back. The server treats repeats as the same message.
    async fn deliver(
        &self,
        user_id: UserId,
        id: MessageId,
        body: Option<String>,
    ) -> ClientResult<Message> {
        let request = SendMessageRequest {
            user_id,
            id: id.clone(),
            body,
        };
        let attempts = self.config.send_attempts.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.post_message(&request).await {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(message_id = %id, attempt, %err, "send failed; retrying");
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                other => break other,
            }
        };

        match result {
            Ok(message) => {
                let acked = {
                    let mut inner = self.inner.lock().await;
                    inner.timeline.ack(message.clone());
                    inner.timeline.get(&id).cloned()
                };
                self.emit(ClientEvent::TimelineChanged);
                Ok(acked.unwrap_or(message))
            }
            Err(err) => match self.withdraw(&id).await {
                Some(confirmed) => {
                    debug!(message_id = %id, %err, "send confirmed by the server's echo");
                    Ok(confirmed)
                }
                None => Err(err),
            },
        }
    }

    async fn post_message(&self, request: &SendMessageRequest) -> ClientResult<Message> {
        Ok(post_json(&self.http, &self.url("/messages"), request)
            .await?
            .json()
            .await?)
    }

    /// Returns the server's record when the send turned out to be committed.
    async fn withdraw(&self, id: &MessageId) -> Option<Message> {
        let outcome = self.inner.lock().await.timeline.fail_pending(id);
        match outcome {
            Withdrawal::Withdrawn(_) => {
                self.emit(ClientEvent::TimelineChanged);
                None
            }
            Withdrawal::Confirmed(message) => {
                self.emit(ClientEvent::TimelineChanged);
                Some(message)
            }
            Withdrawal::NotPending => None,
        }
    }

    fn report_failed_files(&self, id: &MessageId, filenames: &[String], err: &ClientError) {
        for filename in filenames {
            warn!(message_id = %id, %filename, %err, "attachment upload failed");
            self.emit(ClientEvent::AttachmentFailed {
                pending_message_id: id.clone(),
                filename: filename.clone(),
                reason: err.to_string(),
            });
        }
    }

    /// Uploads one prepared batch for `pending_message_id`, forwarding
    /// aggregate progress as [`ClientEvent::UploadProgress`].
    pub async fn upload_attachments(
        &self,
        user_id: UserId,
        pending_message_id: &MessageId,
        files: Vec<PreparedFile>,
    ) -> ClientResult<Vec<Attachment>> {
        let (progress_tx, mut progress_rx) = watch::channel(0u8);
        let form = upload_form(files, Arc::new(progress_tx))?;

        let events = self.events.clone();
        let pending = pending_message_id.clone();
        let forwarder = tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let percent = *progress_rx.borrow_and_update();
                let _ = events.send(ClientEvent::UploadProgress {
                    pending_message_id: pending.clone(),
                    percent,
                });
            }
        });

        let result = async {
            let response = self
                .http
                .post(self.url("/attachments"))
                .query(&[
                    ("user_id", user_id.0.to_string()),
                    ("pending_message_id", pending_message_id.to_string()),
                ])
                .multipart(form)
                .send()
                .await?;
            let attachments: Vec<Attachment> = check(response).await?.json().await?;
            Ok::<_, ClientError>(attachments)
        }
        .await;

        forwarder.abort();
        if result.is_ok() {
            self.emit(ClientEvent::UploadProgress {
                pending_message_id: pending_message_id.clone(),
                percent: 100,
            });
        }
        result
    }

    pub async fn edit_message(&self, id: &MessageId, body: &str) -> ClientResult<Message> {
        let (user_id, _) = self.session().await?;
        let response = self
            .http
            .patch(self.url(&format!("/messages/{id}")))
            .json(&EditMessageRequest {
                user_id,
                body: body.to_string(),
            })
            .send()
            .await?;
        let message: Message = check(response).await?.json().await?;
        self.apply_event(ServerEvent::MessageEdited {
            message: message.clone(),
        })
        .await;
        Ok(message)
    }

    pub async fn delete_message(&self, id: &MessageId) -> ClientResult<()> {
        let (user_id, _) = self.session().await?;
        let response = self
            .http
            .delete(self.url(&format!("/messages/{id}")))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        check(response).await?;
        self.apply_event(ServerEvent::MessageDeleted { id: id.clone() })
            .await;
        Ok(())
    }

    pub async fn download_attachment(&self, attachment: &Attachment) -> ClientResult<Vec<u8>> {
        let response = self.http.get(self.url(&attachment.url)).send().await?;
        Ok(check(response).await?.bytes().await?.to_vec())
    }

    pub async fn keystroke(&self) {
        if let Some(typing) = self.typing_controller().await {
            typing.keystroke().await;
        }
    }

    pub async fn stop_typing(&self) {
        if let Some(typing) = self.typing_controller().await {
            typing.stop().await;
        }
    }

    async fn typing_controller(&self) -> Option<TypingController> {
        self.inner
            .lock()
            .await
            .view
            .as_ref()
            .map(|view| view.typing.clone())
    }

    pub async fn set_presence(&self, status: PresenceStatus) -> ClientResult<()> {
        let (user_id, _) = self.session().await?;
        post_json(
            &self.http,
            &self.url("/presence"),
            &PresenceRequest { user_id, status },
        )
        .await?;
        Ok(())
    }

    pub async fn set_typing(&self, typing: bool) -> ClientResult<()> {
        let (user_id, _) = self.session().await?;
        post_json(
            &self.http,
            &self.url("/typing"),
            &TypingRequest { user_id, typing },
        )
        .await?;
        Ok(())
    }

    pub async fn fetch_presence(&self) -> ClientResult<Vec<PresenceRecord>> {
        let response = self.http.get(self.url("/presence")).send().await?;
        let records: Vec<PresenceRecord> = check(response).await?.json().await?;
        self.inner.lock().await.presence.seed(records.clone());
        for record in &records {
            self.emit(ClientEvent::PresenceChanged(record.clone()));
        }
        Ok(records)
    }

    /// Routes one pushed event into the timeline or the presence view.
    pub async fn apply_event(&self, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        match &event {
            ServerEvent::PresenceChanged { presence } => {
                if inner.presence.apply(&event) {
                    let record = inner
                        .presence
                        .get(presence.user_id)
                        .cloned()
                        .unwrap_or_else(|| presence.clone());
                    drop(inner);
                    self.emit(ClientEvent::PresenceChanged(record));
                }
            }
            ServerEvent::TypingChanged {
                user_id,
                typing_state,
            } => {
                if inner.presence.apply(&event) {
                    drop(inner);
                    self.emit(ClientEvent::TypingChanged {
                        user_id: *user_id,
                        typing_state: *typing_state,
                    });
                }
            }
            _ => {
                let outcome = inner.timeline.ingest(&event);
                let arrival = match (&event, outcome) {
                    (ServerEvent::MessageCreated { message }, Ingested::Inserted) => {
                        let own = inner.user_id == Some(message.author_id);
                        Some((message.id.clone(), inner.scroll.on_new_message(own)))
                    }
                    _ => None,
                };
                drop(inner);
                if outcome.changed_view() {
                    self.emit(ClientEvent::TimelineChanged);
                }
                if let Some((id, action)) = arrival {
                    self.emit(ClientEvent::NewMessage { id, action });
                }
            }
        }
    }

    pub async fn visible_messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .timeline
            .visible()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn has_more_history(&self) -> bool {
        self.inner.lock().await.timeline.has_more()
    }

    pub async fn presence_records(&self) -> Vec<PresenceRecord> {
        self.inner.lock().await.presence.records()
    }

    /// Other users currently typing.
    pub async fn typing_users(&self) -> Vec<UserId> {
        let inner = self.inner.lock().await;
        inner.presence.typing_users(inner.user_id)
    }
}

fn endpoint(server_url: &str, path: &str) -> String {
    format!("{}{path}", server_url.trim_end_matches('/'))
}

async fn post_json<B: Serialize + ?Sized>(
    http: &Client,
    url: &str,
    body: &B,
) -> ClientResult<reqwest::Response> {
    let response = http.post(url).json(body).send().await?;
    check(response).await
}

async fn check(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let api_error = response.json::<ApiError>().await.ok();
    Err(ClientError::from_status(status, api_error))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
