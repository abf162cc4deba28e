//! Message types for PulseMQ
//!
//! Defines the core Message struct and the identifiers used to address
//! messages and consumers.

use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::Error;

/// Unique identifier for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(Self)
            .map_err(|_| Error::InvalidMessage(format!("invalid message id '{s}'")))
    }
}

/// Identity of a consumer, chosen by the client or generated on register
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl ConsumerId {
    /// Generate a fresh random consumer id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A message stored in a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Opaque payload
    #[serde(with = "payload_serde")]
    #[schema(value_type = String)]
    pub payload: Bytes,

    /// When the message was published
    pub created_at: DateTime<Utc>,

    /// Timeout-driven redeliveries already spent by this message
    #[serde(default)]
    pub attempts: u32,
}

impl Message {
    /// Create a new message with the given payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            payload: payload.into(),
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Create a message keeping a publisher-supplied id
    pub fn with_id(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            ..Self::new(payload)
        }
    }

    /// Get the payload as a string (if valid UTF-8)
    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Payloads are written as plain strings when they are UTF-8 and as
/// `{"base64": "..."}` otherwise, so binary data survives a snapshot.
pub mod payload_serde {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match std::str::from_utf8(bytes) {
            Ok(s) => s.serialize(serializer),
            Err(_) => Repr::Binary {
                base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => Ok(Bytes::from(s)),
            Repr::Binary { base64 } => base64::engine::general_purpose::STANDARD
                .decode(base64)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("Hello, World!");
        assert_eq!(msg.payload_as_str(), Some("Hello, World!"));
        assert_eq!(msg.attempts, 0);
    }

    #[test]
    fn test_duplicate_payloads_are_distinct_messages() {
        let a = Message::new("same");
        let b = Message::new("same");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_message_id_parse() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_binary_payload_survives_json() {
        let msg = Message::new(vec![0xff, 0x00, 0xfe]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("base64"));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, msg.payload);
    }

    #[test]
    fn test_text_payload_is_plain_string() {
        let msg = Message::new("hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"], "hello");
    }
}
