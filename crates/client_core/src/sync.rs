//! Poll-driven message synchronizer. This is the path that keeps message
//! state correct; the signal channel only adds latency hints on top.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{MessageId, UserId},
    protocol::MessageRecord,
};
use tracing::{debug, warn};

use crate::{
    error::{DecryptError, SyncError},
    message::Message,
    session::SessionContext,
    signal::SignalOutbox,
    store::{MessageStore, PollOutcome, PollTicket},
    transport::MessageGateway,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No conversation, or `peer_id` is not the active one.
    Skipped,
    Applied { changed: bool, acknowledged: usize },
    /// The conversation changed or a newer cycle landed first.
    Stale,
}

pub struct MessageSynchronizer {
    gateway: Arc<dyn MessageGateway>,
    session: SessionContext,
    store: Arc<MessageStore>,
    outbox: SignalOutbox,
}

impl MessageSynchronizer {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        session: SessionContext,
        store: Arc<MessageStore>,
        outbox: SignalOutbox,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            session,
            store,
            outbox,
        })
    }

    /// One poll cycle. A fetch failure leaves the store untouched; the next
    /// tick simply tries again.
    pub async fn sync(&self, peer_id: Option<UserId>) -> Result<SyncOutcome, SyncError> {
        let Some(peer_id) = peer_id else {
            return Ok(SyncOutcome::Skipped);
        };
        let me = self
            .session
            .user_id()
            .await
            .ok_or(SyncError::NotAuthenticated)?;
        let Some(ticket) = self.store.begin_poll(peer_id).await else {
            return Ok(SyncOutcome::Skipped);
        };

        let records = self.gateway.fetch_conversation(peer_id).await?;
        let now = Utc::now();

        let ids: Vec<MessageId> = records.iter().map(|record| record.id).collect();
        let known = self.store.known_plaintext(&ids).await;
        let messages = join_all(records.into_iter().map(|record| {
            let cached = known.get(&record.id).cloned();
            self.open(record, cached, now)
        }))
        .await;

        let (live, gone): (Vec<Message>, Vec<Message>) = messages
            .into_iter()
            .partition(|message| message.is_visible(now));
        let unread: Vec<MessageId> = live
            .iter()
            .filter(|message| message.receiver_id == me && !message.read)
            .filter_map(|message| message.id)
            .collect();

        let changed = match self.store.apply_poll(ticket, live, gone).await {
            PollOutcome::Applied { changed } => changed,
            PollOutcome::Stale => return Ok(SyncOutcome::Stale),
        };
        self.store.sweep_expired(now).await;

        let acknowledged = if unread.is_empty() {
            0
        } else {
            self.acknowledge(ticket, unread).await
        };
        Ok(SyncOutcome::Applied {
            changed,
            acknowledged,
        })
    }

    /// Turns a record into a message whose body is plaintext or the
    /// placeholder. Revoked and expired records are not worth decrypting.
    async fn open(
        &self,
        record: MessageRecord,
        cached: Option<String>,
        now: chrono::DateTime<Utc>,
    ) -> Message {
        let id = record.id;
        let message = Message::from_record(record);
        if !message.is_encrypted || !message.is_visible(now) {
            return message;
        }
        if let Some(plaintext) = cached {
            return message.with_plaintext(plaintext);
        }
        match self.decrypt(id, &message).await {
            Ok(plaintext) => message.with_plaintext(plaintext),
            Err(err) => {
                warn!(message_id = %id, error = %err, "sync: decrypt failed, body withheld");
                message
            }
        }
    }

    async fn decrypt(&self, id: MessageId, message: &Message) -> Result<String, DecryptError> {
        let envelope = message
            .cipher_envelope
            .as_ref()
            .ok_or(DecryptError::MissingEnvelope(id))?;
        self.gateway
            .decrypt(&envelope.to_request())
            .await
            .map_err(|source| DecryptError::Remote {
                key_id: envelope.key_id.clone(),
                source,
            })
    }

    /// One batched mark-read for the cycle, mirrored over the socket.
    async fn acknowledge(&self, ticket: PollTicket, unread: Vec<MessageId>) -> usize {
        if let Err(err) = self.gateway.mark_read(&unread).await {
            debug!(peer_id = %ticket.peer_id, error = %err, "sync: mark read deferred to next cycle");
            return 0;
        }
        self.store.mark_read_local(ticket.generation, &unread).await;
        let count = unread.len();
        self.outbox.send_read_receipt(unread).await;
        count
    }

    pub async fn run_polling(self: Arc<Self>, peer_id: UserId, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sync(Some(peer_id)).await {
                Ok(outcome) => debug!(peer_id = %peer_id, ?outcome, "sync: cycle finished"),
                Err(err) => warn!(peer_id = %peer_id, error = %err, "sync: cycle aborted"),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
