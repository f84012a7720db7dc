//! Local message cache that merges paginated history with the live stream.
//!
//! Every message is keyed by its client-generated id. An id enters `seen` the
//! first time it is shown and stays there, so duplicate or late deliveries are
//! dropped no matter which path they arrive on.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::MessageId,
    protocol::{Attachment, Message, MessagePage, PageCursor, ServerEvent},
};
use tracing::debug;

type OrderKey = (DateTime<Utc>, MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Inserted,
    Updated,
    Removed,
    Duplicate,
    Ignored,
}

impl Ingested {
    pub fn changed_view(self) -> bool {
        matches!(self, Ingested::Inserted | Ingested::Updated | Ingested::Removed)
    }
}

/// What [`Timeline::fail_pending`] did with an unacknowledged send.
#[derive(Debug)]
pub enum Withdrawal {
    /// Nothing from the server mentioned the id; the local copy is gone.
    Withdrawn(Message),
    /// The server's record already arrived on the stream or in a page, so the
    /// send is kept as delivered.
    Confirmed(Message),
    NotPending,
}

#[derive(Debug, Default)]
pub struct Timeline {
    messages: HashMap<MessageId, Message>,
    order: BTreeSet<OrderKey>,
    seen: HashSet<MessageId>,
    pending: HashSet<MessageId>,
    /// Server records seen for ids that are still pending locally.
    echoed: HashMap<MessageId, Message>,
    tombstones: HashSet<MessageId>,
    has_more: bool,
    generation: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, event: &ServerEvent) -> Ingested {
        match event {
            ServerEvent::MessageCreated { message } => {
                if self.seen.contains(&message.id) {
                    if self.pending.contains(&message.id) {
                        self.echoed.insert(message.id.clone(), message.clone());
                    }
                    debug!(message_id = %message.id, "duplicate delivery dropped");
                    return Ingested::Duplicate;
                }
                if message.deleted || self.tombstones.contains(&message.id) {
                    return Ingested::Ignored;
                }
                self.insert(message.clone());
                Ingested::Inserted
            }
            ServerEvent::MessageEdited { message } => {
                let Some(current) = self.messages.get_mut(&message.id) else {
                    return Ingested::Ignored;
                };
                current.body = message.body.clone();
                current.edited_at = message.edited_at;
                current.attachments = message.attachments.clone();
                Ingested::Updated
            }
            ServerEvent::MessageDeleted { id } => {
                self.tombstones.insert(id.clone());
                self.seen.insert(id.clone());
                if self.remove(id).is_some() {
                    Ingested::Removed
                } else {
                    Ingested::Ignored
                }
            }
            ServerEvent::PresenceChanged { .. } | ServerEvent::TypingChanged { .. } => {
                Ingested::Ignored
            }
        }
    }

    /// Shows a locally composed message before the server has acknowledged it.
    pub fn insert_optimistic(&mut self, message: Message) {
        self.pending.insert(message.id.clone());
        self.insert(message);
    }

    /// Replaces the optimistic copy with the server's record, which carries
    /// the authoritative `sent_at`.
    pub fn ack(&mut self, mut message: Message) -> Ingested {
        self.pending.remove(&message.id);
        self.echoed.remove(&message.id);
        if self.tombstones.contains(&message.id) || message.deleted {
            self.remove(&message.id);
            return Ingested::Removed;
        }
        if let Some(previous) = self.remove(&message.id) {
            // An edit event for this message may already have been applied.
            if previous.edited_at > message.edited_at {
                message.body = previous.body;
                message.edited_at = previous.edited_at;
            }
            if message.attachments.is_empty() {
                message.attachments = previous.attachments;
            }
        }
        self.insert(message);
        Ingested::Updated
    }

    /// Withdraws a send whose response never arrived. If the server's record
    /// was already delivered some other way the send is acknowledged with it
    /// instead, since the server has committed it.
    pub fn fail_pending(&mut self, id: &MessageId) -> Withdrawal {
        if !self.pending.contains(id) {
            return Withdrawal::NotPending;
        }
        if let Some(record) = self.echoed.remove(id) {
            self.ack(record.clone());
            return Withdrawal::Confirmed(self.messages.get(id).cloned().unwrap_or(record));
        }
        self.pending.remove(id);
        self.seen.remove(id);
        match self.remove(id) {
            Some(message) => Withdrawal::Withdrawn(message),
            None => Withdrawal::NotPending,
        }
    }

    pub fn merge_attachments(&mut self, id: &MessageId, attachments: &[Attachment]) -> bool {
        let Some(message) = self.messages.get_mut(id) else {
            return false;
        };
        let mut changed = false;
        for attachment in attachments {
            if !message.attachments.iter().any(|a| a.id == attachment.id) {
                message.attachments.push(attachment.clone());
                changed = true;
            }
        }
        changed
    }

    /// Inserts older history. Returns how many messages became visible.
    pub fn merge_page(&mut self, page: &MessagePage) -> usize {
        let mut inserted = 0;
        for message in &page.messages {
            if message.deleted || self.tombstones.contains(&message.id) {
                continue;
            }
            if self.pending.contains(&message.id) {
                self.echoed.insert(message.id.clone(), message.clone());
                continue;
            }
            if let Some(current) = self.messages.get_mut(&message.id) {
                if message.edited_at > current.edited_at {
                    current.body = message.body.clone();
                    current.edited_at = message.edited_at;
                    current.attachments = message.attachments.clone();
                }
                continue;
            }
            if self.seen.contains(&message.id) {
                continue;
            }
            self.insert(message.clone());
            inserted += 1;
        }
        self.has_more = page.has_more;
        inserted
    }

    /// Merges a page requested with [`Timeline::oldest_cursor`] while the
    /// cache was at `generation`. A page that straddles a reset is dropped,
    /// since its cursor no longer borders what is cached.
    pub fn merge_older(&mut self, page: &MessagePage, generation: u64) -> Option<usize> {
        if generation != self.generation {
            debug!(generation, current = self.generation, "stale history page dropped");
            return None;
        }
        Some(self.merge_page(page))
    }

    /// Bumped by every reset.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drops everything except unacknowledged sends and known tombstones.
    pub fn reset(&mut self) {
        self.generation += 1;
        let pending: Vec<Message> = self
            .pending
            .iter()
            .filter_map(|id| self.messages.get(id).cloned())
            .collect();
        self.messages.clear();
        self.order.clear();
        self.seen.clear();
        self.has_more = false;
        for message in pending {
            self.insert(message);
        }
    }

    pub fn reset_with_latest(&mut self, page: &MessagePage) -> usize {
        self.reset();
        self.merge_page(page)
    }

    /// Cursor for the next backward page: the oldest acknowledged message.
    pub fn oldest_cursor(&self) -> Option<PageCursor> {
        self.order
            .iter()
            .find(|(_, id)| !self.pending.contains(id))
            .map(|(sent_at, id)| PageCursor {
                sent_at: *sent_at,
                id: id.clone(),
            })
    }

    /// Oldest first.
    pub fn visible(&self) -> Vec<&Message> {
        self.order
            .iter()
            .filter_map(|(_, id)| self.messages.get(id))
            .collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn insert(&mut self, message: Message) {
        self.seen.insert(message.id.clone());
        self.order.insert(message.order_key());
        self.messages.insert(message.id.clone(), message);
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let message = self.messages.remove(id)?;
        self.order.remove(&message.order_key());
        Some(message)
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
