//! Fan-out of mutation events to every open push stream.
//!
//! Each connection owns a bounded queue. Publishing never waits on a
//! consumer: a full or closed queue tears that connection down and the client
//! is expected to reconnect and resync.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    user_id: UserId,
    tx: mpsc::Sender<ServerEvent>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
    publish_order: Mutex<()>,
    next_connection_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            publish_order: Mutex::new(()),
            next_connection_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn subscribe(self: &Arc<Self>, user_id: UserId) -> Connection {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { user_id, tx });
        info!(connection_id = id.0, user_id = user_id.0, "stream subscribed");
        Connection {
            id,
            user_id,
            rx,
            bus: Arc::clone(self),
        }
    }

    pub fn unsubscribe(&self, id: ConnectionId) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(subscriber) = removed {
            info!(
                connection_id = id.0,
                user_id = subscriber.user_id.0,
                "stream unsubscribed"
            );
        }
    }

    /// Delivers `event` to every open connection and returns how many
    /// accepted it. Calls are serialized so all subscribers see one order.
    pub fn publish(&self, event: ServerEvent) -> usize {
        let _order = self
            .publish_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, subscriber) in subscribers.iter() {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            connection_id = id.0,
                            user_id = subscriber.user_id.0,
                            "outbound queue full; dropping slow connection"
                        );
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in dead {
                subscribers.remove(&id);
            }
        }

        debug!(kind = event.kind(), delivered, "event published");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_subscribed(&self, id: ConnectionId) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

/// One open push stream. Dropping it removes the registration.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    rx: mpsc::Receiver<ServerEvent>,
    bus: Arc<EventBus>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// `None` once the bus has torn this connection down and the queue is drained.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
