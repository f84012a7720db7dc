use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{PresenceStatus, TypingState, UserId},
    protocol::{PresenceRecord, ServerEvent},
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::error::ClientResult;

pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound presence signals. Implemented over HTTP by the client and by
/// recorders in tests.
#[async_trait]
pub trait PresenceSignals: Send + Sync {
    async fn send_presence(&self, status: PresenceStatus) -> ClientResult<()>;
    async fn send_typing(&self, typing: bool) -> ClientResult<()>;
}

/// This client's copy of everyone's presence, updated only from server events.
#[derive(Debug, Default, Clone)]
pub struct PresenceView {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceView {
    pub fn seed(&mut self, records: Vec<PresenceRecord>) {
        self.records = records
            .into_iter()
            .map(|record| (record.user_id, record))
            .collect();
    }

    /// Returns `true` if the event changed the view.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::PresenceChanged { presence } => {
                let mut presence = presence.clone();
                if !presence.is_online {
                    presence.typing_state = TypingState::Idle;
                }
                let changed = self.records.get(&presence.user_id) != Some(&presence);
                self.records.insert(presence.user_id, presence);
                changed
            }
            ServerEvent::TypingChanged {
                user_id,
                typing_state,
            } => {
                let record = self.records.entry(*user_id).or_insert_with(|| PresenceRecord {
                    user_id: *user_id,
                    is_online: false,
                    last_seen_at: Utc::now(),
                    typing_state: TypingState::Idle,
                });
                if *typing_state == TypingState::Typing {
                    record.is_online = true;
                }
                let changed = record.typing_state != *typing_state;
                record.typing_state = *typing_state;
                changed
            }
            _ => false,
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.records.get(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .records
            .values()
            .filter(|record| record.is_online)
            .map(|record| record.user_id)
            .collect();
        users.sort_by_key(|user| user.0);
        users
    }

    pub fn typing_users(&self, except: Option<UserId>) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .records
            .values()
            .filter(|record| record.typing_state == TypingState::Typing)
            .map(|record| record.user_id)
            .filter(|user| Some(*user) != except)
            .collect();
        users.sort_by_key(|user| user.0);
        users
    }

    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by_key(|record| record.user_id.0);
        records
    }
}

#[derive(Default)]
struct TypingInner {
    typing: bool,
    last_start_sent: Option<Instant>,
    stop_task: Option<JoinHandle<()>>,
}

/// Turns raw keystrokes into debounced start/stop typing signals.
#[derive(Clone)]
pub struct TypingController {
    signals: Arc<dyn PresenceSignals>,
    debounce: Duration,
    timeout: Duration,
    inner: Arc<Mutex<TypingInner>>,
}

impl TypingController {
    pub fn new(signals: Arc<dyn PresenceSignals>, debounce: Duration, timeout: Duration) -> Self {
        Self {
            signals,
            debounce,
            timeout,
            inner: Arc::new(Mutex::new(TypingInner::default())),
        }
    }

    pub async fn keystroke(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let send_start = !inner.typing
            || inner
                .last_start_sent
                .map_or(true, |sent| now.duration_since(sent) >= self.debounce);
        if send_start {
            inner.typing = true;
            inner.last_start_sent = Some(now);
            if let Err(err) = self.signals.send_typing(true).await {
                warn!(%err, "failed to send typing start");
            }
        }

        if let Some(task) = inner.stop_task.take() {
            task.abort();
        }
        let controller = self.clone();
        inner.stop_task = Some(tokio::spawn(async move {
            time::sleep(controller.timeout).await;
            controller.expire().await;
        }));
    }

    /// Ends typing now, e.g. when the message is sent or the view closes.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.stop_task.take() {
            task.abort();
        }
        if inner.typing {
            inner.typing = false;
            inner.last_start_sent = None;
            if let Err(err) = self.signals.send_typing(false).await {
                warn!(%err, "failed to send typing stop");
            }
        }
    }

    pub async fn is_typing(&self) -> bool {
        self.inner.lock().await.typing
    }

    async fn expire(&self) {
        let mut inner = self.inner.lock().await;
        inner.stop_task = None;
        if inner.typing {
            debug!("typing timed out");
            inner.typing = false;
            inner.last_start_sent = None;
            if let Err(err) = self.signals.send_typing(false).await {
                warn!(%err, "failed to send typing stop");
            }
        }
    }
}

/// Sends an online heartbeat immediately and then every `every` until aborted.
pub fn spawn_heartbeat(signals: Arc<dyn PresenceSignals>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = signals.send_presence(PresenceStatus::Online).await {
                warn!(%err, "heartbeat failed");
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
