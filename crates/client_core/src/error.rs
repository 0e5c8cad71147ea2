//! Failure classes of the engine. None of these is fatal to the process.

use shared::{domain::MessageId, error::ApiException};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("{endpoint} request failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} rejected: {source}")]
    Api {
        endpoint: &'static str,
        #[source]
        source: ApiException,
    },
    #[error("{endpoint} returned an unreadable body: {reason}")]
    Decode {
        endpoint: &'static str,
        reason: String,
    },
}

impl TransportError {
    /// HTTP status for server-side rejections.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { source, .. } => Some(source.status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("message {0} is flagged encrypted but carries no cipher envelope")]
    MissingEnvelope(MessageId),
    #[error("decrypt service failed for key {key_id}: {source}")]
    Remote {
        key_id: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message body exceeds {limit} characters")]
    TooLong { limit: usize },
    #[error("message body is empty")]
    Empty,
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("no conversation selected")]
    NoConversation,
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("message {0} is not in the active conversation")]
    NotFound(MessageId),
    #[error("only the sender can delete message {0}")]
    NotSender(MessageId),
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("server declined to delete message {0}")]
    Rejected(MessageId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("poll cycle aborted: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no credential available for the signal channel")]
    MissingCredential,
    #[error("invalid signal endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signal connect failed: {0}")]
    Connect(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("bearer token must not be empty")]
    InvalidToken,
}
