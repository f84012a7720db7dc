use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{TypingState, UserId},
    protocol::{PresenceRecord, ServerEvent},
};
use tracing::{debug, info};

use crate::bus::EventBus;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub typing_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }
}

impl PresenceConfig {
    pub fn liveness_timeout(&self) -> chrono::Duration {
        to_chrono(self.heartbeat_interval * 2)
    }
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    typing_since: Option<DateTime<Utc>>,
}

/// Shared presence table. Each user's record sits behind its own lock; the
/// outer map is only write-locked when a user is seen for the first time.
pub struct PresenceTracker {
    records: RwLock<HashMap<UserId, Arc<Mutex<PresenceEntry>>>>,
    bus: Arc<EventBus>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(bus: Arc<EventBus>, config: PresenceConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bus,
            config,
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    /// Heartbeat or explicit online signal.
    pub fn heartbeat(&self, user_id: UserId, now: DateTime<Utc>) {
        let entry = self.entry(user_id, now);
        let mut entry = lock(&entry);
        entry.record.last_seen_at = now;
        if !entry.record.is_online {
            entry.record.is_online = true;
            info!(user_id = user_id.0, "user online");
            self.bus.publish(ServerEvent::PresenceChanged {
                presence: entry.record.clone(),
            });
        }
    }

    pub fn go_offline(&self, user_id: UserId, now: DateTime<Utc>) {
        let Some(entry) = self.existing(user_id) else {
            return;
        };
        let mut entry = lock(&entry);
        if entry.record.is_online {
            entry.record.last_seen_at = now;
            self.transition_offline(&mut entry);
        }
    }

    pub fn set_typing(&self, user_id: UserId, typing: bool, now: DateTime<Utc>) {
        if typing {
            self.heartbeat(user_id, now);
        }
        let Some(entry) = self.existing(user_id) else {
            return;
        };
        let mut entry = lock(&entry);
        if !entry.record.is_online {
            return;
        }

        let next = if typing {
            entry.typing_since = Some(now);
            TypingState::Typing
        } else {
            entry.typing_since = None;
            TypingState::Idle
        };
        if entry.record.typing_state != next {
            entry.record.typing_state = next;
            self.bus.publish(ServerEvent::TypingChanged {
                user_id,
                typing_state: next,
            });
        }
    }

    /// Expires silent users and stale typing states. Returns the number of
    /// records that changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let liveness_timeout = self.config.liveness_timeout();
        let typing_timeout = to_chrono(self.config.typing_timeout);
        let entries: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut changed = 0;
        for entry in entries {
            let mut entry = lock(&entry);
            if !entry.record.is_online {
                continue;
            }
            if now - entry.record.last_seen_at >= liveness_timeout {
                debug!(
                    user_id = entry.record.user_id.0,
                    "heartbeat missed; marking offline"
                );
                self.transition_offline(&mut entry);
                changed += 1;
                continue;
            }
            let stale_typing = entry
                .typing_since
                .is_some_and(|since| now - since >= typing_timeout);
            if stale_typing {
                entry.typing_since = None;
                entry.record.typing_state = TypingState::Idle;
                self.bus.publish(ServerEvent::TypingChanged {
                    user_id: entry.record.user_id,
                    typing_state: TypingState::Idle,
                });
                changed += 1;
            }
        }
        changed
    }

    pub fn get(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.existing(user_id)
            .map(|entry| lock(&entry).record.clone())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.get(user_id).is_some_and(|record| record.is_online)
    }

    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let entries: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut records: Vec<_> = entries
            .into_iter()
            .map(|entry| lock(&entry).record.clone())
            .collect();
        records.sort_by_key(|record| record.user_id.0);
        records
    }

    fn transition_offline(&self, entry: &mut PresenceEntry) {
        let user_id = entry.record.user_id;
        if entry.record.typing_state == TypingState::Typing {
            entry.record.typing_state = TypingState::Idle;
            self.bus.publish(ServerEvent::TypingChanged {
                user_id,
                typing_state: TypingState::Idle,
            });
        }
        entry.typing_since = None;
        entry.record.is_online = false;
        info!(user_id = user_id.0, "user offline");
        self.bus.publish(ServerEvent::PresenceChanged {
            presence: entry.record.clone(),
        });
    }

    fn existing(&self, user_id: UserId) -> Option<Arc<Mutex<PresenceEntry>>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    fn entry(&self, user_id: UserId, now: DateTime<Utc>) -> Arc<Mutex<PresenceEntry>> {
        if let Some(entry) = self.existing(user_id) {
            return entry;
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(user_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(PresenceEntry {
                    record: PresenceRecord {
                        user_id,
                        is_online: false,
                        last_seen_at: now,
                        typing_state: TypingState::Idle,
                    },
                    typing_since: None,
                }))
            })
            .clone()
    }
}

fn lock(entry: &Mutex<PresenceEntry>) -> std::sync::MutexGuard<'_, PresenceEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
