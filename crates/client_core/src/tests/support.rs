//! Fakes shared by the engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, Peer, UserId},
    error::ApiException,
    protocol::{
        DecryptRequest, DeleteMessageResponse, MessageRecord, SendMessageRequest,
        SendMessageResponse, TypingNotification, TypingStatusResponse,
    },
};
use tokio::sync::mpsc;

use crate::{
    config::ClientSettings,
    error::{ChannelError, TransportError},
    signal::{InboundEvent, OutboundFrame, SignalConnector, SignalLink},
    transport::MessageGateway,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(UserId),
    Create(SendMessageRequest),
    MarkRead(Vec<MessageId>),
    Delete(MessageId),
    Decrypt(String),
    ListPeers,
    TypingStarted(UserId),
    TypingStopped(UserId),
    TypingStatus(UserId),
    UnreadCount,
}

/// What the fake server answers. Edit through [`RecordingGateway::script`].
pub struct GatewayScript {
    /// Sender recorded for echoed messages.
    pub me: Option<UserId>,
    pub conversation: Vec<MessageRecord>,
    pub fail_fetch: bool,
    /// Ciphertext to plaintext; ciphertexts missing here fail to decrypt.
    pub plaintexts: HashMap<String, String>,
    pub fail_create: bool,
    pub create_delay: Duration,
    /// Echo created messages into `conversation`, as the real server does.
    pub echo_created: bool,
    pub reject_delete: bool,
    pub delete_delay: Duration,
    pub fail_mark_read: bool,
    pub peers: Vec<Peer>,
    pub typing_status: TypingStatusResponse,
    pub unread: u64,
}

impl Default for GatewayScript {
    fn default() -> Self {
        Self {
            me: None,
            conversation: Vec::new(),
            fail_fetch: false,
            plaintexts: HashMap::new(),
            fail_create: false,
            create_delay: Duration::ZERO,
            echo_created: true,
            reject_delete: false,
            delete_delay: Duration::ZERO,
            fail_mark_read: false,
            peers: Vec::new(),
            typing_status: TypingStatusResponse {
                is_typing: false,
                typing_user_id: String::new(),
            },
            unread: 0,
        }
    }
}

#[derive(Default)]
pub struct RecordingGateway {
    script: Mutex<GatewayScript>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self) -> MutexGuard<'_, GatewayScript> {
        self.script.lock().expect("script lock")
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

fn unavailable(endpoint: &'static str) -> TransportError {
    TransportError::Api {
        endpoint,
        source: ApiException::new(503, "service unavailable"),
    }
}

#[async_trait]
impl MessageGateway for RecordingGateway {
    async fn fetch_conversation(
        &self,
        peer_id: UserId,
    ) -> Result<Vec<MessageRecord>, TransportError> {
        self.record(Call::Fetch(peer_id));
        let script = self.script();
        if script.fail_fetch {
            return Err(unavailable("list_messages"));
        }
        Ok(script.conversation.clone())
    }

    async fn create_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, TransportError> {
        self.record(Call::Create(request.clone()));
        let delay = self.script().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script();
        if script.fail_create {
            return Err(unavailable("create_message"));
        }
        let now = Utc::now();
        let message_id = MessageId::new_random();
        let expires_at = (request.expiration_minutes > 0)
            .then(|| now + chrono::Duration::minutes(i64::from(request.expiration_minutes)));
        if let (true, Some(sender_id)) = (script.echo_created, script.me) {
            let mut echoed = record(message_id, sender_id, request.receiver_id, &request.content, now);
            echoed.expires_at = expires_at;
            echoed.read_once = request.read_once;
            script.conversation.push(echoed);
        }
        Ok(SendMessageResponse {
            message_id,
            sent: true,
            timestamp: Some(now),
            expires_at,
        })
    }

    async fn mark_read(&self, message_ids: &[MessageId]) -> Result<(), TransportError> {
        self.record(Call::MarkRead(message_ids.to_vec()));
        let mut script = self.script();
        if script.fail_mark_read {
            return Err(unavailable("mark_read"));
        }
        for record in script.conversation.iter_mut() {
            if message_ids.contains(&record.id) {
                record.read = true;
            }
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        message_id: MessageId,
    ) -> Result<DeleteMessageResponse, TransportError> {
        self.record(Call::Delete(message_id));
        let delay = self.script().delete_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script();
        if script.reject_delete {
            return Ok(DeleteMessageResponse {
                deleted: false,
                message_id: Some(message_id),
            });
        }
        script.conversation.retain(|record| record.id != message_id);
        Ok(DeleteMessageResponse {
            deleted: true,
            message_id: Some(message_id),
        })
    }

    async fn decrypt(&self, request: &DecryptRequest) -> Result<String, TransportError> {
        self.record(Call::Decrypt(request.key_id.clone()));
        self.script()
            .plaintexts
            .get(&request.encrypted_content)
            .cloned()
            .ok_or_else(|| unavailable("decrypt"))
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, TransportError> {
        self.record(Call::ListPeers);
        Ok(self.script().peers.clone())
    }

    async fn typing_started(
        &self,
        notification: &TypingNotification,
    ) -> Result<(), TransportError> {
        self.record(Call::TypingStarted(notification.receiver_id));
        Ok(())
    }

    async fn typing_stopped(
        &self,
        notification: &TypingNotification,
    ) -> Result<(), TransportError> {
        self.record(Call::TypingStopped(notification.receiver_id));
        Ok(())
    }

    async fn typing_status(&self, user_id: UserId) -> Result<TypingStatusResponse, TransportError> {
        self.record(Call::TypingStatus(user_id));
        Ok(self.script().typing_status.clone())
    }

    async fn unread_count(&self) -> Result<u64, TransportError> {
        self.record(Call::UnreadCount);
        Ok(self.script().unread)
    }
}

pub fn record(
    id: MessageId,
    sender_id: UserId,
    receiver_id: UserId,
    content: &str,
    timestamp: DateTime<Utc>,
) -> MessageRecord {
    MessageRecord {
        id,
        sender_id,
        receiver_id,
        content: content.to_string(),
        timestamp,
        expires_at: None,
        read: false,
        read_once: false,
        revoked: false,
        expired: false,
        is_encrypted: false,
        iv: None,
        key_id: None,
    }
}

pub fn encrypted_record(
    sender_id: UserId,
    receiver_id: UserId,
    ciphertext: &str,
    timestamp: DateTime<Utc>,
) -> MessageRecord {
    MessageRecord {
        is_encrypted: true,
        iv: Some(format!("iv-{ciphertext}")),
        key_id: Some(format!("key-{ciphertext}")),
        ..record(MessageId::new_random(), sender_id, receiver_id, ciphertext, timestamp)
    }
}

pub fn test_settings() -> ClientSettings {
    ClientSettings {
        server_url: "http://127.0.0.1:9".into(),
        ..ClientSettings::default()
    }
}

/// The far side of a scripted connection.
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<InboundEvent>,
    pub from_client: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ServerEnd {
    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(InboundEvent::Closed(code));
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.send(InboundEvent::Text(text.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Refuse,
    Accept,
}

/// Plays back connect outcomes in order; refuses once the script runs out.
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Attempt>>,
    attempts: Mutex<Vec<tokio::time::Instant>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl ScriptedConnector {
    pub fn new(outcomes: &[Attempt]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, server_ends) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            attempts: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, server_ends)
    }

    pub fn attempts(&self) -> Vec<tokio::time::Instant> {
        self.attempts.lock().expect("attempts lock").clone()
    }
}

#[async_trait]
impl SignalConnector for ScriptedConnector {
    async fn connect(&self, token: &str) -> Result<SignalLink, ChannelError> {
        assert!(!token.is_empty(), "connect attempted without a token");
        self.attempts
            .lock()
            .expect("attempts lock")
            .push(tokio::time::Instant::now());
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(Attempt::Refuse);
        match outcome {
            Attempt::Refuse => Err(ChannelError::Connect("connection refused".into())),
            Attempt::Accept => {
                let (outbound, from_client) = mpsc::unbounded_channel();
                let (to_client, inbound) = mpsc::unbounded_channel();
                let _ = self.accepted.send(ServerEnd {
                    to_client,
                    from_client,
                });
                Ok(SignalLink { outbound, inbound })
            }
        }
    }
}

/// Waits for the first event matching `wanted`, skipping the rest.
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<crate::events::ClientEvent>,
    wanted: impl Fn(&crate::events::ClientEvent) -> bool,
) -> crate::events::ClientEvent {
    use tokio::sync::broadcast::error::RecvError;

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
