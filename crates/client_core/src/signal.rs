//! Signal channel: a reconnecting websocket for typing and presence hints.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{MessageId, UserId},
    protocol::{InboundSignal, OutboundSignal},
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ChannelError,
    events::{ClientEvent, EventBus},
    session::SessionContext,
    timers::{TimerKey, TimerRegistry},
    typing::TypingCoordinator,
};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnecting after `attempt` consecutive failures have
    /// already been retried, or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Text(String),
    Closed(u16),
}

pub struct SignalLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<SignalLink, ChannelError>;
}

pub struct DisabledConnector;

#[async_trait]
impl SignalConnector for DisabledConnector {
    async fn connect(&self, _token: &str) -> Result<SignalLink, ChannelError> {
        Err(ChannelError::Connect("signal channel disabled".into()))
    }
}

pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn url_with_token(&self, token: &str) -> Result<Url, ChannelError> {
        let mut url = Url::parse(&self.endpoint).map_err(|err| ChannelError::InvalidUrl {
            url: self.endpoint.clone(),
            reason: err.to_string(),
        })?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl SignalConnector for WsConnector {
    async fn connect(&self, token: &str) -> Result<SignalLink, ChannelError> {
        let url = self.url_with_token(token)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let (message, closing) = match frame {
                    OutboundFrame::Text(text) => (Message::Text(text), false),
                    OutboundFrame::Close => (
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })),
                        true,
                    ),
                };
                if let Err(err) = ws_writer.send(message).await {
                    debug!(error = %err, "signal: websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let code = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(InboundEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or(CLOSE_NO_STATUS, |frame| u16::from(frame.code));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "signal: websocket receive failed");
                        break CLOSE_ABNORMAL;
                    }
                    None => break CLOSE_ABNORMAL,
                }
            };
            let _ = inbound_tx.send(InboundEvent::Closed(code));
        });

        Ok(SignalLink { outbound, inbound })
    }
}

/// Write side of the channel; holds a sender only while `Open`.
#[derive(Clone, Default)]
pub struct SignalOutbox {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>>,
}

impl SignalOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn send_typing(&self, receiver_id: UserId, is_typing: bool) -> bool {
        self.send_signal(&OutboundSignal::TypingIndicator {
            receiver_id,
            is_typing,
        })
        .await
    }

    pub async fn send_read_receipt(&self, message_ids: Vec<MessageId>) -> bool {
        if message_ids.is_empty() {
            return false;
        }
        self.send_signal(&OutboundSignal::ReadReceipt { message_ids })
            .await
    }

    async fn send_signal(&self, signal: &OutboundSignal) -> bool {
        let text = match serde_json::to_string(signal) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "signal: failed to encode frame");
                return false;
            }
        };
        let guard = self.sender.lock().await;
        match guard.as_ref() {
            Some(sender) => sender.send(OutboundFrame::Text(text)).is_ok(),
            None => {
                debug!("signal: channel not open, frame dropped");
                false
            }
        }
    }

    pub(crate) async fn attach(&self, sender: mpsc::UnboundedSender<OutboundFrame>) {
        *self.sender.lock().await = Some(sender);
    }

    pub(crate) async fn detach(&self) -> Option<mpsc::UnboundedSender<OutboundFrame>> {
        self.sender.lock().await.take()
    }
}

pub struct SignalChannel {
    connector: Arc<dyn SignalConnector>,
    session: SessionContext,
    policy: ReconnectPolicy,
    typing: Arc<TypingCoordinator>,
    timers: Arc<TimerRegistry>,
    outbox: SignalOutbox,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
}

impl SignalChannel {
    pub fn new(
        connector: Arc<dyn SignalConnector>,
        session: SessionContext,
        policy: ReconnectPolicy,
        typing: Arc<TypingCoordinator>,
        timers: Arc<TimerRegistry>,
        outbox: SignalOutbox,
        events: EventBus,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            session,
            policy,
            typing,
            timers,
            outbox,
            events,
            state,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn outbox(&self) -> SignalOutbox {
        self.outbox.clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.session.token().await.is_none() {
            return Err(ChannelError::MissingCredential);
        }
        let channel = Arc::clone(self);
        self.timers
            .spawn(TimerKey::Reconnect, channel.supervise())
            .await;
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(sender) = self.outbox.detach().await {
            let _ = sender.send(OutboundFrame::Close);
        }
        self.timers.cancel(TimerKey::Reconnect).await;
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Closed(CLOSE_NORMAL));
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            let Some(token) = self.session.token().await else {
                self.set_state(ConnectionState::Disconnected);
                return;
            };

            self.set_state(ConnectionState::Connecting);
            let code = match self.connector.connect(&token).await {
                Ok(link) => {
                    attempt = 0;
                    self.pump(link).await
                }
                Err(err) => {
                    warn!(attempt, error = %err, "signal: connect failed");
                    CLOSE_ABNORMAL
                }
            };
            self.outbox.detach().await;
            self.set_state(ConnectionState::Closed(code));

            if code == CLOSE_NORMAL {
                info!("signal: closed normally");
                return;
            }

            match self.policy.delay_for(attempt) {
                Some(delay) => {
                    attempt += 1;
                    info!(
                        attempt,
                        code,
                        delay_ms = delay.as_millis() as u64,
                        "signal: reconnect scheduled"
                    );
                    let _ = self
                        .events
                        .send(ClientEvent::ReconnectScheduled { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        attempts = attempt + 1,
                        "signal: giving up, polling continues without the socket"
                    );
                    let _ = self.events.send(ClientEvent::SignalGaveUp {
                        attempts: attempt + 1,
                    });
                    return;
                }
            }
        }
    }

    async fn pump(&self, link: SignalLink) -> u16 {
        let SignalLink {
            outbound,
            mut inbound,
        } = link;
        self.outbox.attach(outbound).await;
        self.set_state(ConnectionState::Open);
        info!("signal: connected");

        while let Some(event) = inbound.recv().await {
            match event {
                InboundEvent::Text(text) => self.handle_frame(&text).await,
                InboundEvent::Closed(code) => return code,
            }
        }
        CLOSE_ABNORMAL
    }

    async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<InboundSignal>(text) {
            Ok(InboundSignal::TypingIndicator {
                sender_id,
                is_typing,
            }) => self.typing.apply_remote(sender_id, is_typing).await,
            Ok(InboundSignal::Unknown) => debug!("signal: ignoring unknown frame type"),
            Ok(other) => debug!(frame = ?other, "signal: frame left to the poll path"),
            Err(err) => warn!(error = %err, "signal: unreadable frame ignored"),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            let _ = self.events.send(ClientEvent::ConnectionChanged(next));
        }
    }
}

#[cfg(test)]
#[path = "tests/signal_tests.rs"]
mod tests;
