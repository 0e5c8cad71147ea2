use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, UserId};

/// Message as listed by `GET /api/messages?conversationWith={peer}`.
///
/// Field aliases cover the shapes the message server has used over time
/// (`recipientId`/`receiverId`, `sentAt`/`timestamp`, `adminRevoked`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(alias = "recipientId")]
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(alias = "sentAt", alias = "createdAt", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        alias = "expirationTime",
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "isRead")]
    pub read: bool,
    #[serde(default, alias = "isReadOnce")]
    pub read_once: bool,
    #[serde(default, alias = "isRevoked", alias = "adminRevoked")]
    pub revoked: bool,
    #[serde(default)]
    pub expired: bool,
    #[serde(default, alias = "encrypted")]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Body of `POST /api/messages`. `expiration_minutes == 0` means no expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
    pub expiration_minutes: u32,
    #[serde(default)]
    pub read_once: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    #[serde(alias = "id")]
    pub message_id: MessageId,
    #[serde(default)]
    pub sent: bool,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageResponse {
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub encrypted_content: String,
    pub iv: String,
    pub key_id: String,
}

/// The decrypt service answers either with a bare JSON string or an object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DecryptResponse {
    Plain(String),
    Wrapped {
        #[serde(alias = "decryptedContent", alias = "plaintext")]
        content: String,
    },
}

impl DecryptResponse {
    pub fn into_plaintext(self) -> String {
        match self {
            Self::Plain(text) | Self::Wrapped { content: text } => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotification {
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatusResponse {
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub typing_user_id: String,
}

impl TypingStatusResponse {
    /// The peer currently typing to us, if the server reported one.
    pub fn typing_user(&self) -> Option<UserId> {
        if !self.is_typing {
            return None;
        }
        UserId::parse(&self.typing_user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

/// Frames pushed by the server over the signal socket.
///
/// Only `typing_indicator` carries data the client acts on; the rest are
/// accepted so that logging can name them. Anything else lands in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundSignal {
    TypingIndicator {
        #[serde(rename = "senderId")]
        sender_id: UserId,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    NewMessage {},
    MessageRead {},
    MessageRevoked {},
    UserStatus {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundSignal {
    TypingIndicator {
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    ReadReceipt {
        #[serde(rename = "messageIds")]
        message_ids: Vec<MessageId>,
    },
}

/// Server timestamps arrive either as RFC 3339 or as zone-less local
/// date-times; the latter are taken as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}"))),
            }
        }
    }
}
