//! Authenticated HTTP boundary to the message server.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, Peer, UserId},
    error::ApiException,
    protocol::{
        DecryptRequest, DecryptResponse, DeleteMessageResponse, MarkReadRequest, MessageRecord,
        SendMessageRequest, SendMessageResponse, TypingNotification, TypingStatusResponse,
        UnreadCountResponse,
    },
};
use tracing::warn;

use crate::{error::TransportError, session::SessionContext};

#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn fetch_conversation(&self, peer_id: UserId)
        -> Result<Vec<MessageRecord>, TransportError>;
    async fn create_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, TransportError>;
    async fn mark_read(&self, message_ids: &[MessageId]) -> Result<(), TransportError>;
    async fn delete_message(
        &self,
        message_id: MessageId,
    ) -> Result<DeleteMessageResponse, TransportError>;
    async fn decrypt(&self, request: &DecryptRequest) -> Result<String, TransportError>;
    async fn list_peers(&self) -> Result<Vec<Peer>, TransportError>;
    async fn typing_started(&self, notification: &TypingNotification)
        -> Result<(), TransportError>;
    async fn typing_stopped(&self, notification: &TypingNotification)
        -> Result<(), TransportError>;
    async fn typing_status(&self, user_id: UserId) -> Result<TypingStatusResponse, TransportError>;
    async fn unread_count(&self) -> Result<u64, TransportError>;
}

pub struct HttpGateway {
    http: Client,
    server_url: String,
    session: SessionContext,
}

impl HttpGateway {
    pub fn new(server_url: impl Into<String>, session: SessionContext) -> Self {
        let server_url: String = server_url.into();
        Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    /// Attaches the bearer token, sends, and turns every failure into a
    /// logged [`TransportError`].
    async fn execute(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, TransportError> {
        let Some(token) = self.session.token().await else {
            warn!(endpoint, "transport: no session, request not sent");
            return Err(TransportError::NotAuthenticated);
        };

        let response = request.bearer_auth(token).send().await.map_err(|source| {
            warn!(endpoint, error = %source, "transport: request failed");
            TransportError::Request { endpoint, source }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let source = ApiException::from_body(status.as_u16(), &body);
        warn!(
            endpoint,
            status = status.as_u16(),
            error = %source.message,
            "transport: request rejected"
        );
        Err(TransportError::Api { endpoint, source })
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        self.execute(endpoint, request)
            .await?
            .json::<T>()
            .await
            .map_err(|err| {
                warn!(endpoint, error = %err, "transport: unreadable response");
                TransportError::Decode {
                    endpoint,
                    reason: err.to_string(),
                }
            })
    }
}

#[async_trait]
impl MessageGateway for HttpGateway {
    async fn fetch_conversation(
        &self,
        peer_id: UserId,
    ) -> Result<Vec<MessageRecord>, TransportError> {
        let request = self
            .http
            .get(self.url("/api/messages"))
            .query(&[("conversationWith", peer_id.to_string())]);
        self.execute_json("list_messages", request).await
    }

    async fn create_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, TransportError> {
        let builder = self.http.post(self.url("/api/messages")).json(request);
        self.execute_json("create_message", builder).await
    }

    async fn mark_read(&self, message_ids: &[MessageId]) -> Result<(), TransportError> {
        let body = MarkReadRequest {
            message_ids: message_ids.to_vec(),
        };
        let request = self.http.post(self.url("/api/messages/read")).json(&body);
        self.execute("mark_read", request).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        message_id: MessageId,
    ) -> Result<DeleteMessageResponse, TransportError> {
        let request = self
            .http
            .delete(self.url(&format!("/api/messages/{message_id}")));
        self.execute_json("delete_message", request).await
    }

    async fn decrypt(&self, request: &DecryptRequest) -> Result<String, TransportError> {
        let builder = self.http.post(self.url("/api/decrypt")).json(request);
        let response = self.execute("decrypt", builder).await?;
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim_start().starts_with("application/json"));
        let text = response.text().await.map_err(|err| TransportError::Decode {
            endpoint: "decrypt",
            reason: err.to_string(),
        })?;
        if !is_json {
            return Ok(text);
        }
        serde_json::from_str::<DecryptResponse>(&text)
            .map(DecryptResponse::into_plaintext)
            .map_err(|err| {
                warn!(endpoint = "decrypt", error = %err, "transport: unreadable response");
                TransportError::Decode {
                    endpoint: "decrypt",
                    reason: err.to_string(),
                }
            })
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, TransportError> {
        let request = self.http.get(self.url("/user/all"));
        self.execute_json("list_peers", request).await
    }

    async fn typing_started(
        &self,
        notification: &TypingNotification,
    ) -> Result<(), TransportError> {
        let request = self
            .http
            .post(self.url("/api/messages/typing"))
            .json(notification);
        self.execute("typing_started", request).await?;
        Ok(())
    }

    async fn typing_stopped(
        &self,
        notification: &TypingNotification,
    ) -> Result<(), TransportError> {
        let request = self
            .http
            .post(self.url("/api/messages/typing-stopped"))
            .json(notification);
        self.execute("typing_stopped", request).await?;
        Ok(())
    }

    async fn typing_status(&self, user_id: UserId) -> Result<TypingStatusResponse, TransportError> {
        let request = self
            .http
            .get(self.url("/api/messages/typing-status"))
            .query(&[("userId", user_id.to_string())]);
        self.execute_json("typing_status", request).await
    }

    async fn unread_count(&self) -> Result<u64, TransportError> {
        let request = self.http.get(self.url("/api/messages/unread/count"));
        let response: UnreadCountResponse = self.execute_json("unread_count", request).await?;
        Ok(response.unread_count)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
