//! Message lifecycle store for the active conversation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{LocalId, MessageId, UserId},
    protocol::{SendMessageRequest, SendMessageResponse},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{DeleteError, SendError},
    events::{ClientEvent, EventBus},
    message::{DeliveryState, Message, UNAVAILABLE_BODY},
    session::SessionContext,
    transport::MessageGateway,
};

pub fn validate_body(body: &str, max_chars: usize) -> Result<(), SendError> {
    if body.chars().count() > max_chars {
        return Err(SendError::TooLong { limit: max_chars });
    }
    if body.trim().is_empty() {
        return Err(SendError::Empty);
    }
    Ok(())
}

/// Expiry on the wire is whole minutes, rounded up. Zero means none.
pub fn expiration_minutes(expire_after: Option<Duration>) -> u32 {
    let Some(after) = expire_after else {
        return 0;
    };
    let seconds = after.as_secs() + u64::from(after.subsec_nanos() > 0);
    u32::try_from(seconds.div_ceil(60)).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub expire_after: Option<Duration>,
    pub read_once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket {
    pub peer_id: UserId,
    pub generation: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Applied { changed: bool },
    Stale,
}

struct Entry {
    seq: u64,
    message: Message,
    seen_in_poll: bool,
}

#[derive(Default)]
struct StoreState {
    conversation: Option<UserId>,
    generation: u64,
    next_entry_seq: u64,
    next_poll_seq: u64,
    latest_poll_seq: u64,
    entries: Vec<Entry>,
    pending_deletes: HashSet<MessageId>,
    destroyed: HashSet<MessageId>,
}

impl StoreState {
    fn push(&mut self, message: Message, seen_in_poll: bool) {
        self.next_entry_seq += 1;
        self.entries.push(Entry {
            seq: self.next_entry_seq,
            message,
            seen_in_poll,
        });
    }

    fn position_of(&self, id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.id == Some(id))
    }

    fn destroy(&mut self, id: MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.message.id != Some(id));
        self.destroyed.insert(id);
        self.entries.len() != before
    }
}

pub struct MessageStore {
    gateway: Arc<dyn MessageGateway>,
    session: SessionContext,
    events: EventBus,
    max_body_chars: usize,
    reconcile_window: chrono::Duration,
    state: Mutex<StoreState>,
}

impl MessageStore {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        session: SessionContext,
        events: EventBus,
        max_body_chars: usize,
        reconcile_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            session,
            events,
            max_body_chars,
            reconcile_window: chrono::Duration::from_std(reconcile_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            state: Mutex::new(StoreState::default()),
        })
    }

    pub fn max_body_chars(&self) -> usize {
        self.max_body_chars
    }

    pub async fn select_conversation(&self, peer_id: Option<UserId>) -> u64 {
        let generation = {
            let mut state = self.state.lock().await;
            let generation = state.generation + 1;
            let next_poll_seq = state.next_poll_seq;
            *state = StoreState {
                conversation: peer_id,
                generation,
                next_poll_seq,
                latest_poll_seq: next_poll_seq,
                ..StoreState::default()
            };
            generation
        };
        self.notify();
        generation
    }

    pub async fn conversation(&self) -> Option<UserId> {
        self.state.lock().await.conversation
    }

    pub async fn visible_messages(&self) -> Vec<Message> {
        self.visible_messages_at(Utc::now()).await
    }

    pub async fn visible_messages_at(&self, now: DateTime<Utc>) -> Vec<Message> {
        let state = self.state.lock().await;
        let mut visible: Vec<&Entry> = state
            .entries
            .iter()
            .filter(|entry| entry.message.is_visible(now))
            .collect();
        visible.sort_by_key(|entry| (entry.message.created_at, entry.seq));
        visible.into_iter().map(|entry| entry.message.clone()).collect()
    }

    pub async fn is_delete_pending(&self, id: MessageId) -> bool {
        self.state.lock().await.pending_deletes.contains(&id)
    }

    pub async fn known_plaintext(&self, ids: &[MessageId]) -> HashMap<MessageId, String> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter_map(|entry| {
                let id = entry.message.id?;
                (ids.contains(&id) && entry.message.has_plaintext())
                    .then(|| (id, entry.message.body.clone()))
            })
            .collect()
    }

    /// Appends an optimistic record and sends the create request in the background.
    pub async fn send(
        self: &Arc<Self>,
        receiver_id: UserId,
        body: &str,
        options: SendOptions,
    ) -> Result<Message, SendError> {
        validate_body(body, self.max_body_chars)?;
        let sender_id = self
            .session
            .user_id()
            .await
            .ok_or(SendError::NotAuthenticated)?;

        let (message, generation) = {
            let mut state = self.state.lock().await;
            if state.conversation != Some(receiver_id) {
                return Err(SendError::NoConversation);
            }
            let message = Message::optimistic(
                sender_id,
                receiver_id,
                body,
                Utc::now(),
                options.expire_after,
                options.read_once,
            );
            state.push(message.clone(), false);
            (message, state.generation)
        };
        self.notify();

        let request = SendMessageRequest {
            receiver_id,
            content: body.to_string(),
            expiration_minutes: expiration_minutes(options.expire_after),
            read_once: options.read_once,
        };
        let store = Arc::clone(self);
        let local_id = message.local_id;
        tokio::spawn(async move {
            match store.gateway.create_message(&request).await {
                Ok(response) if response.sent => {
                    store.confirm(generation, local_id, response).await
                }
                Ok(response) => {
                    store
                        .fail(
                            generation,
                            local_id,
                            format!("server did not accept message {}", response.message_id),
                        )
                        .await
                }
                Err(err) => store.fail(generation, local_id, err.to_string()).await,
            }
        });

        Ok(message)
    }

    async fn confirm(&self, generation: u64, local_id: LocalId, response: SendMessageResponse) {
        let message_id = response.message_id;
        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            let Some(index) = state
                .entries
                .iter()
                .position(|entry| entry.message.local_id == local_id)
            else {
                return;
            };

            let duplicate = state.entries.iter().position(|entry| {
                entry.message.id == Some(message_id) && entry.message.local_id != local_id
            });

            if state.destroyed.contains(&message_id) {
                state.entries.remove(index);
            } else if let Some(existing) = duplicate {
                // A poll already delivered this id as a separate row.
                let local = state.entries.remove(index);
                let existing = if existing > index { existing - 1 } else { existing };
                let polled = &mut state.entries[existing].message;
                if !polled.has_plaintext() {
                    polled.body = local.message.body;
                }
            } else {
                let message = &mut state.entries[index].message;
                message.id = Some(message_id);
                if let Some(timestamp) = response.timestamp {
                    message.created_at = timestamp;
                }
                if response.expires_at.is_some() {
                    message.expires_at = response.expires_at;
                }
                message.delivery = DeliveryState::Confirmed;
            }
        }
        info!(message_id = %message_id, "store: send confirmed");
        let _ = self.events.send(ClientEvent::MessageConfirmed {
            local_id,
            message_id,
        });
        self.notify();
    }

    async fn fail(&self, generation: u64, local_id: LocalId, reason: String) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            let Some(entry) = state
                .entries
                .iter_mut()
                .find(|entry| entry.message.local_id == local_id)
            else {
                return;
            };
            if entry.message.id.is_some() {
                // Reconciled by a poll while the create call was failing.
                return;
            }
            entry.message.delivery = DeliveryState::Failed;
        }
        warn!(local_id = %local_id, reason = %reason, "store: send failed");
        let _ = self
            .events
            .send(ClientEvent::SendFailed { local_id, reason });
        self.notify();
    }

    pub async fn begin_poll(&self, peer_id: UserId) -> Option<PollTicket> {
        let mut state = self.state.lock().await;
        if state.conversation != Some(peer_id) {
            return None;
        }
        state.next_poll_seq += 1;
        Some(PollTicket {
            peer_id,
            generation: state.generation,
            seq: state.next_poll_seq,
        })
    }

    /// `live` holds visible records, `gone` the revoked or expired ones.
    pub async fn apply_poll(
        &self,
        ticket: PollTicket,
        live: Vec<Message>,
        gone: Vec<Message>,
    ) -> PollOutcome {
        let changed = {
            let mut state = self.state.lock().await;
            if state.generation != ticket.generation
                || state.conversation != Some(ticket.peer_id)
                || ticket.seq < state.latest_poll_seq
            {
                debug!(peer_id = %ticket.peer_id, seq = ticket.seq, "store: stale poll result dropped");
                return PollOutcome::Stale;
            }
            state.latest_poll_seq = ticket.seq;

            let mut changed = false;
            let mut polled = HashSet::new();
            for incoming in live {
                let Some(id) = incoming.id else {
                    continue;
                };
                polled.insert(id);
                if state.destroyed.contains(&id) {
                    continue;
                }
                changed |= self.upsert(&mut state, id, incoming);
            }

            for incoming in gone {
                let Some(id) = incoming.id else {
                    continue;
                };
                if let Some(index) = self.find_optimistic(&state, &incoming) {
                    state.entries.remove(index);
                    changed = true;
                }
                if !state.destroyed.contains(&id) {
                    changed |= state.destroy(id);
                }
            }

            // Confirmed rows the server stopped listing are gone for good.
            let vanished: Vec<MessageId> = state
                .entries
                .iter()
                .filter(|entry| entry.seen_in_poll)
                .filter_map(|entry| entry.message.id)
                .filter(|id| !polled.contains(id))
                .collect();
            for id in vanished {
                changed |= state.destroy(id);
            }
            changed
        };

        if changed {
            self.notify();
        }
        PollOutcome::Applied { changed }
    }

    fn upsert(&self, state: &mut StoreState, id: MessageId, incoming: Message) -> bool {
        let index = state
            .position_of(id)
            .or_else(|| self.find_optimistic(state, &incoming));
        match index {
            Some(index) => {
                let entry = &mut state.entries[index];
                let merged = merge(&entry.message, incoming);
                let changed = merged != entry.message || !entry.seen_in_poll;
                entry.message = merged;
                entry.seen_in_poll = true;
                changed
            }
            None => {
                state.push(incoming, true);
                true
            }
        }
    }

    fn find_optimistic(&self, state: &StoreState, incoming: &Message) -> Option<usize> {
        state.entries.iter().position(|entry| {
            let local = &entry.message;
            local.id.is_none()
                && local.sender_id == incoming.sender_id
                && local.receiver_id == incoming.receiver_id
                && local.body == incoming.body
                && (local.created_at - incoming.created_at).abs() <= self.reconcile_window
        })
    }

    pub async fn mark_read_local(&self, generation: u64, ids: &[MessageId]) {
        let changed = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            let mut changed = false;
            for entry in state.entries.iter_mut() {
                if entry.message.id.is_some_and(|id| ids.contains(&id)) && !entry.message.read {
                    entry.message.read = true;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.notify();
        }
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut state = self.state.lock().await;
            let expired: Vec<MessageId> = state
                .entries
                .iter()
                .filter(|entry| entry.message.is_expired(now))
                .filter_map(|entry| entry.message.id)
                .collect();
            for id in &expired {
                state.destroy(*id);
            }
            expired.len()
        };
        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// At most one delete request per id is ever in flight.
    pub async fn delete(&self, id: MessageId) -> Result<(), DeleteError> {
        let me = self
            .session
            .user_id()
            .await
            .ok_or(DeleteError::NotAuthenticated)?;

        let generation = {
            let mut state = self.state.lock().await;
            if state.destroyed.contains(&id) || state.pending_deletes.contains(&id) {
                debug!(message_id = %id, "store: delete already handled");
                return Ok(());
            }
            let index = state.position_of(id).ok_or(DeleteError::NotFound(id))?;
            if state.entries[index].message.sender_id != me {
                return Err(DeleteError::NotSender(id));
            }
            state.pending_deletes.insert(id);
            state.generation
        };

        let result = self.gateway.delete_message(id).await;

        let outcome = {
            let mut state = self.state.lock().await;
            if state.generation == generation {
                state.pending_deletes.remove(&id);
            }
            match result {
                Ok(response) if response.deleted => {
                    if state.generation == generation {
                        state.destroy(id);
                    }
                    Ok(())
                }
                Ok(_) => Err(DeleteError::Rejected(id)),
                Err(err) => Err(DeleteError::Transport(err)),
            }
        };

        match &outcome {
            Ok(()) => {
                info!(message_id = %id, "store: message deleted");
                self.notify();
            }
            Err(err) => warn!(message_id = %id, error = %err, "store: delete failed"),
        }
        outcome
    }

    fn notify(&self) {
        let _ = self.events.send(ClientEvent::MessagesChanged);
    }
}

// A recovered plaintext is never replaced by the placeholder.
fn merge(existing: &Message, incoming: Message) -> Message {
    let body = if incoming.body == UNAVAILABLE_BODY && existing.has_plaintext() {
        existing.body.clone()
    } else {
        incoming.body
    };
    Message {
        body,
        local_id: existing.local_id,
        provisional_expires_at: existing.provisional_expires_at,
        cipher_envelope: if existing.has_plaintext() {
            None
        } else {
            incoming.cipher_envelope
        },
        ..incoming
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
