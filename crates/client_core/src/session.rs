use std::sync::Arc;

use shared::domain::UserId;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

/// Authenticated identity shared by every component.
///
/// Cloning is cheap; all clones observe the same session, so a logout is
/// seen immediately by the gateway and the signal channel.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn login(&self, token: impl Into<String>, user_id: UserId) -> Result<(), SessionError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SessionError::InvalidToken);
        }
        *self.inner.write().await = Some(Session { user_id, token });
        info!(user_id = %user_id, "session: authenticated");
        Ok(())
    }

    pub async fn logout(&self) {
        if self.inner.write().await.take().is_some() {
            info!("session: cleared");
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.inner.read().await.clone()
    }

    pub async fn token(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|session| session.token.clone())
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.read().await.as_ref().map(|session| session.user_id)
    }
}
