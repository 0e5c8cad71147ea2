use std::time::Duration;

use shared::domain::{LocalId, MessageId, Peer, UserId};
use tokio::sync::broadcast;

use crate::signal::ConnectionState;

/// Notifications for the view layer. Receivers re-read state through the
/// facade; events only say what changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MessagesChanged,
    ConversationSelected(Option<UserId>),
    PeersUpdated(Vec<Peer>),
    TypingChanged {
        peer_id: UserId,
        is_typing: bool,
    },
    ConnectionChanged(ConnectionState),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    SignalGaveUp {
        attempts: u32,
    },
    MessageConfirmed {
        local_id: LocalId,
        message_id: MessageId,
    },
    SendFailed {
        local_id: LocalId,
        reason: String,
    },
    Error(String),
}

pub type EventBus = broadcast::Sender<ClientEvent>;

pub fn event_bus() -> EventBus {
    let (events, _) = broadcast::channel(1024);
    events
}
