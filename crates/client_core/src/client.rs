use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::domain::{MessageId, Peer, UserId};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{ChannelError, DeleteError, SendError, SessionError, SyncError, TransportError},
    events::{event_bus, ClientEvent, EventBus},
    message::Message,
    roster::RosterDirectory,
    session::SessionContext,
    signal::{
        ConnectionState, DisabledConnector, SignalChannel, SignalConnector, SignalOutbox,
        WsConnector,
    },
    store::{validate_body, MessageStore, SendOptions},
    sync::{MessageSynchronizer, SyncOutcome},
    timers::{TimerKey, TimerRegistry},
    transport::{HttpGateway, MessageGateway},
    typing::TypingCoordinator,
};

/// Entry point for the view layer. Owns one session, one timer registry and
/// one event bus, and wires every component around them.
pub struct MessagingClient {
    settings: ClientSettings,
    session: SessionContext,
    gateway: Arc<dyn MessageGateway>,
    timers: Arc<TimerRegistry>,
    events: EventBus,
    store: Arc<MessageStore>,
    typing: Arc<TypingCoordinator>,
    signal: Arc<SignalChannel>,
    synchronizer: Arc<MessageSynchronizer>,
    roster: Arc<RosterDirectory>,
    signal_enabled: bool,
    conversation: Mutex<Option<UserId>>,
    roster_primed: AtomicBool,
}

impl MessagingClient {
    /// HTTP gateway plus a websocket connector derived from `settings`.
    pub fn new(settings: ClientSettings) -> Result<Arc<Self>, ChannelError> {
        let session = SessionContext::new();
        let gateway = Arc::new(HttpGateway::new(settings.server_url.clone(), session.clone()));
        let connector: Arc<dyn SignalConnector> = match settings.signal_endpoint()? {
            Some(endpoint) => Arc::new(WsConnector::new(endpoint)),
            None => Arc::new(DisabledConnector),
        };
        Ok(Self::new_with_dependencies(settings, session, gateway, connector))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        session: SessionContext,
        gateway: Arc<dyn MessageGateway>,
        connector: Arc<dyn SignalConnector>,
    ) -> Arc<Self> {
        let events = event_bus();
        let timers = Arc::new(TimerRegistry::new());
        let outbox = SignalOutbox::new();

        let store = MessageStore::new(
            Arc::clone(&gateway),
            session.clone(),
            events.clone(),
            settings.max_body_chars,
            settings.reconcile_window,
        );
        let typing = TypingCoordinator::new(
            Arc::clone(&gateway),
            session.clone(),
            Arc::clone(&timers),
            outbox.clone(),
            events.clone(),
            settings.typing_idle,
        );
        let signal = SignalChannel::new(
            connector,
            session.clone(),
            settings.reconnect,
            Arc::clone(&typing),
            Arc::clone(&timers),
            outbox.clone(),
            events.clone(),
        );
        let synchronizer = MessageSynchronizer::new(
            Arc::clone(&gateway),
            session.clone(),
            Arc::clone(&store),
            outbox,
        );
        let roster = RosterDirectory::new(Arc::clone(&gateway), session.clone(), events.clone());
        let signal_enabled = settings.signal_enabled;

        Arc::new(Self {
            settings,
            session,
            gateway,
            timers,
            events,
            store,
            typing,
            signal,
            synchronizer,
            roster,
            signal_enabled,
            conversation: Mutex::new(None),
            roster_primed: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Installs the credential, then starts the roster poll and the signal
    /// channel. A signal failure is logged; polling works without it.
    pub async fn login(
        self: &Arc<Self>,
        token: impl Into<String>,
        user_id: UserId,
    ) -> Result<(), SessionError> {
        self.timers.clear_all().await;
        self.session.login(token, user_id).await?;
        self.roster_primed.store(false, Ordering::SeqCst);

        let client = Arc::clone(self);
        let every = self.settings.roster_interval;
        self.timers
            .spawn(TimerKey::Roster, async move {
                client.run_roster_poll(every).await;
            })
            .await;

        // A re-login keeps the open conversation; its timers went with clear_all.
        if let Some(peer_id) = self.selected_conversation().await {
            self.start_conversation_timers(peer_id).await;
        }

        if self.signal_enabled {
            if let Err(err) = self.signal.start().await {
                warn!(error = %err, "client: signal channel not started");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
            }
        }
        Ok(())
    }

    pub async fn logout(&self) {
        self.typing.stop_now().await;
        self.signal.close().await;
        self.timers.clear_all().await;
        *self.conversation.lock().await = None;
        self.store.select_conversation(None).await;
        self.typing.reset().await;
        self.roster.clear().await;
        self.session.logout().await;
        let _ = self.events.send(ClientEvent::ConversationSelected(None));
        info!("client: logged out");
    }

    /// Switches to `raw_peer_id`. Anything that is not a UUID leaves no
    /// conversation selected.
    pub async fn select_conversation(self: &Arc<Self>, raw_peer_id: &str) -> Option<UserId> {
        let peer_id = UserId::parse(raw_peer_id);
        if peer_id.is_none() {
            warn!(raw_peer_id, "client: malformed peer id, no conversation selected");
        }
        self.switch_conversation(peer_id).await;
        peer_id
    }

    async fn switch_conversation(self: &Arc<Self>, peer_id: Option<UserId>) {
        self.timers.clear_conversation().await;
        self.typing.stop_now().await;
        *self.conversation.lock().await = peer_id;
        self.store.select_conversation(peer_id).await;
        let _ = self.events.send(ClientEvent::ConversationSelected(peer_id));

        let Some(peer_id) = peer_id else {
            return;
        };
        info!(peer_id = %peer_id, "client: conversation selected");
        self.start_conversation_timers(peer_id).await;
    }

    async fn start_conversation_timers(self: &Arc<Self>, peer_id: UserId) {
        let synchronizer = Arc::clone(&self.synchronizer);
        self.timers
            .spawn(
                TimerKey::Poll,
                synchronizer.run_polling(peer_id, self.settings.poll_interval),
            )
            .await;
        let typing = Arc::clone(&self.typing);
        self.timers
            .spawn(
                TimerKey::TypingStatus,
                typing.run_status_poll(self.settings.typing_status_interval),
            )
            .await;
    }

    pub async fn selected_conversation(&self) -> Option<UserId> {
        *self.conversation.lock().await
    }

    pub async fn send_message(
        &self,
        body: &str,
        expire_after: Option<Duration>,
    ) -> Result<Message, SendError> {
        self.send_with_options(
            body,
            SendOptions {
                expire_after,
                read_once: false,
            },
        )
        .await
    }

    pub async fn send_with_options(
        &self,
        body: &str,
        options: SendOptions,
    ) -> Result<Message, SendError> {
        validate_body(body, self.store.max_body_chars())?;
        let peer_id = self
            .selected_conversation()
            .await
            .ok_or(SendError::NoConversation)?;
        let message = self.store.send(peer_id, body, options).await?;
        self.typing.stop_now().await;
        Ok(message)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), DeleteError> {
        self.store.delete(message_id).await
    }

    pub async fn visible_messages(&self) -> Vec<Message> {
        self.store.visible_messages().await
    }

    /// Runs one poll cycle now instead of waiting for the next tick.
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        let peer_id = self.selected_conversation().await;
        self.synchronizer.sync(peer_id).await
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.roster.peers().await
    }

    pub async fn typing_peers(&self) -> Vec<UserId> {
        self.typing.typing_peers().await
    }

    pub async fn notify_local_activity(&self) {
        if let Some(peer_id) = self.selected_conversation().await {
            self.typing.notify_local_activity(peer_id).await;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.signal.state()
    }

    pub async fn unread_count(&self) -> Result<u64, TransportError> {
        self.gateway.unread_count().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn run_roster_poll(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh_roster().await;
        }
    }

    /// The first roster after login picks a conversation if none is open.
    async fn refresh_roster(self: &Arc<Self>) {
        let peers = match self.roster.refresh().await {
            Ok(peers) => peers,
            Err(err) => {
                debug!(error = %err, "client: roster refresh failed");
                return;
            }
        };
        if peers.is_empty() || self.roster_primed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.selected_conversation().await.is_none() {
            self.switch_conversation(Some(peers[0].id)).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
