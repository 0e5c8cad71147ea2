use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{
    domain::UserId,
    protocol::{TypingNotification, TypingStatusResponse},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    events::{ClientEvent, EventBus},
    session::SessionContext,
    signal::SignalOutbox,
    timers::{TimerKey, TimerRegistry},
    transport::MessageGateway,
};

#[derive(Default)]
struct TypingState {
    /// Peer we last told that we are typing, until the idle timer fires.
    local_peer: Option<UserId>,
    remote: HashMap<UserId, bool>,
}

/// Debounced local typing hints plus the last known remote typing flags.
pub struct TypingCoordinator {
    gateway: Arc<dyn MessageGateway>,
    session: SessionContext,
    timers: Arc<TimerRegistry>,
    outbox: SignalOutbox,
    events: EventBus,
    idle: Duration,
    state: Mutex<TypingState>,
}

impl TypingCoordinator {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        session: SessionContext,
        timers: Arc<TimerRegistry>,
        outbox: SignalOutbox,
        events: EventBus,
        idle: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            session,
            timers,
            outbox,
            events,
            idle,
            state: Mutex::new(TypingState::default()),
        })
    }

    /// Called on every local input event while talking to `peer_id`.
    pub async fn notify_local_activity(self: &Arc<Self>, peer_id: UserId) {
        let previous = {
            let mut state = self.state.lock().await;
            state.local_peer.replace(peer_id)
        };

        if previous != Some(peer_id) {
            if let Some(previous) = previous {
                self.emit(previous, false).await;
            }
            self.emit(peer_id, true).await;
        }

        let coordinator = Arc::clone(self);
        self.timers
            .spawn(TimerKey::TypingIdle, async move {
                tokio::time::sleep(coordinator.idle).await;
                coordinator.idle_elapsed(peer_id).await;
            })
            .await;
    }

    async fn idle_elapsed(&self, peer_id: UserId) {
        let was_typing = {
            let mut state = self.state.lock().await;
            if state.local_peer == Some(peer_id) {
                state.local_peer = None;
                true
            } else {
                false
            }
        };
        if was_typing {
            self.emit(peer_id, false).await;
        }
    }

    /// Ends local typing immediately, e.g. when the message is sent.
    pub async fn stop_now(&self) {
        self.timers.cancel(TimerKey::TypingIdle).await;
        let previous = self.state.lock().await.local_peer.take();
        if let Some(peer_id) = previous {
            self.emit(peer_id, false).await;
        }
    }

    pub async fn is_locally_typing(&self) -> bool {
        self.state.lock().await.local_peer.is_some()
    }

    async fn emit(&self, peer_id: UserId, is_typing: bool) {
        let Some(me) = self.session.user_id().await else {
            return;
        };
        let notification = TypingNotification {
            sender_id: me,
            receiver_id: peer_id,
        };
        let result = if is_typing {
            self.gateway.typing_started(&notification).await
        } else {
            self.gateway.typing_stopped(&notification).await
        };
        if let Err(err) = result {
            debug!(peer_id = %peer_id, is_typing, error = %err, "typing: hint not delivered");
        }
        self.outbox.send_typing(peer_id, is_typing).await;
    }

    /// Remote typing is last-write-wins; no debounce and no expiry.
    pub async fn apply_remote(&self, peer_id: UserId, is_typing: bool) {
        let previous = self
            .state
            .lock()
            .await
            .remote
            .insert(peer_id, is_typing);
        if previous != Some(is_typing) {
            let _ = self.events.send(ClientEvent::TypingChanged { peer_id, is_typing });
        }
    }

    /// Folds a typing-status poll into the map: the reported peer is typing
    /// and nobody else is.
    pub async fn apply_status_poll(&self, status: &TypingStatusResponse) {
        let typing_user = status.typing_user();
        let changes = {
            let mut state = self.state.lock().await;
            let mut changes = Vec::new();
            for (peer_id, is_typing) in state.remote.iter_mut() {
                let next = typing_user == Some(*peer_id);
                if *is_typing != next {
                    *is_typing = next;
                    changes.push((*peer_id, next));
                }
            }
            match typing_user {
                Some(peer_id) => {
                    if !state.remote.contains_key(&peer_id) {
                        state.remote.insert(peer_id, true);
                        changes.push((peer_id, true));
                    }
                }
                None => state.remote.clear(),
            }
            changes
        };
        for (peer_id, is_typing) in changes {
            let _ = self.events.send(ClientEvent::TypingChanged { peer_id, is_typing });
        }
    }

    pub async fn refresh_status(&self) {
        let Some(me) = self.session.user_id().await else {
            return;
        };
        match self.gateway.typing_status(me).await {
            Ok(status) => self.apply_status_poll(&status).await,
            Err(err) => debug!(error = %err, "typing: status poll failed"),
        }
    }

    pub async fn run_status_poll(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh_status().await;
        }
    }

    pub async fn is_peer_typing(&self, peer_id: UserId) -> bool {
        self.state
            .lock()
            .await
            .remote
            .get(&peer_id)
            .copied()
            .unwrap_or(false)
    }

    pub async fn typing_peers(&self) -> Vec<UserId> {
        let state = self.state.lock().await;
        let mut peers: Vec<UserId> = state
            .remote
            .iter()
            .filter(|(_, is_typing)| **is_typing)
            .map(|(peer_id, _)| *peer_id)
            .collect();
        peers.sort();
        peers
    }

    pub async fn reset(&self) {
        *self.state.lock().await = TypingState::default();
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
