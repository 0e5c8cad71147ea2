use std::sync::Arc;

use shared::domain::Peer;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    error::TransportError,
    events::{ClientEvent, EventBus},
    session::SessionContext,
    transport::MessageGateway,
};

/// Peers the user can talk to. Each refresh replaces the whole list.
pub struct RosterDirectory {
    gateway: Arc<dyn MessageGateway>,
    session: SessionContext,
    events: EventBus,
    peers: RwLock<Vec<Peer>>,
}

impl RosterDirectory {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        session: SessionContext,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            session,
            events,
            peers: RwLock::new(Vec::new()),
        })
    }

    pub async fn refresh(&self) -> Result<Vec<Peer>, TransportError> {
        let me = self.session.user_id().await;
        let mut peers = self.gateway.list_peers().await?;
        peers.retain(|peer| Some(peer.id) != me);

        let changed = {
            let mut current = self.peers.write().await;
            let changed = *current != peers;
            *current = peers.clone();
            changed
        };
        if changed {
            debug!(count = peers.len(), "roster: peers updated");
            let _ = self.events.send(ClientEvent::PeersUpdated(peers.clone()));
        }
        Ok(peers)
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }

    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }
}
