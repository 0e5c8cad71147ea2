use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::{
    domain::{LocalId, MessageId, UserId},
    protocol::{DecryptRequest, MessageRecord},
};

/// Shown instead of a body that could not be decrypted.
pub const UNAVAILABLE_BODY: &str = "[Message no longer available]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// Everything the decrypt service needs to recover a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub encrypted_content: String,
    pub iv: String,
    pub key_id: String,
}

impl CipherEnvelope {
    fn from_record(record: &MessageRecord) -> Option<Self> {
        let iv = record.iv.as_deref().filter(|iv| !iv.is_empty())?;
        let key_id = record.key_id.as_deref().filter(|key| !key.is_empty())?;
        Some(Self {
            encrypted_content: record.content.clone(),
            iv: iv.to_string(),
            key_id: key_id.to_string(),
        })
    }

    pub fn to_request(&self) -> DecryptRequest {
        DecryptRequest {
            encrypted_content: self.encrypted_content.clone(),
            iv: self.iv.clone(),
            key_id: self.key_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Server id; `None` until the create call is confirmed.
    pub id: Option<MessageId>,
    pub local_id: LocalId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub is_encrypted: bool,
    pub cipher_envelope: Option<CipherEnvelope>,
    pub created_at: DateTime<Utc>,
    /// Authoritative expiry as reported by the server.
    pub expires_at: Option<DateTime<Utc>>,
    /// Client-side estimate for display only. Never consulted for visibility.
    pub provisional_expires_at: Option<DateTime<Utc>>,
    pub read_once: bool,
    pub read: bool,
    pub revoked: bool,
    pub expired: bool,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn optimistic(
        sender_id: UserId,
        receiver_id: UserId,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
        expire_after: Option<Duration>,
        read_once: bool,
    ) -> Self {
        let provisional_expires_at = expire_after
            .and_then(|after| chrono::Duration::from_std(after).ok())
            .map(|after| created_at + after);
        Self {
            id: None,
            local_id: LocalId::new_random(),
            sender_id,
            receiver_id,
            body: body.into(),
            is_encrypted: false,
            cipher_envelope: None,
            created_at,
            expires_at: None,
            provisional_expires_at,
            read_once,
            read: false,
            revoked: false,
            expired: false,
            delivery: DeliveryState::Pending,
        }
    }

    /// Encrypted records start out with the placeholder body; the
    /// envelope is kept so the synchronizer can request decryption.
    pub fn from_record(record: MessageRecord) -> Self {
        let cipher_envelope = record
            .is_encrypted
            .then(|| CipherEnvelope::from_record(&record))
            .flatten();
        let body = if record.is_encrypted {
            UNAVAILABLE_BODY.to_string()
        } else {
            record.content
        };
        Self {
            id: Some(record.id),
            local_id: LocalId::new_random(),
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            body,
            is_encrypted: record.is_encrypted,
            cipher_envelope,
            created_at: record.timestamp,
            expires_at: record.expires_at,
            provisional_expires_at: None,
            read_once: record.read_once,
            read: record.read,
            revoked: record.revoked,
            expired: record.expired,
            delivery: DeliveryState::Confirmed,
        }
    }

    pub fn with_plaintext(mut self, plaintext: impl Into<String>) -> Self {
        self.body = plaintext.into();
        self.cipher_envelope = None;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now)
    }

    pub fn has_plaintext(&self) -> bool {
        self.body != UNAVAILABLE_BODY
    }
}
