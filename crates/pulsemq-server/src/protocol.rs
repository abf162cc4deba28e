//! Wire protocol: one JSON object per line, tagged by `type`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use pulsemq_core::Outbound;
use pulsemq_types::message::payload_serde;
use pulsemq_types::{ConsumerId, MessageId};
use serde::{Deserialize, Serialize};

/// Longest accepted line, delimiter excluded
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frames sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        queue: String,
        #[serde(default)]
        consumer_id: Option<ConsumerId>,
    },
    Publish {
        queue: String,
        #[serde(with = "payload_serde")]
        payload: Bytes,
        #[serde(default)]
        message_id: Option<MessageId>,
    },
    Ack {
        queue: String,
        message_id: MessageId,
    },
    Ping,
}

/// Frames sent by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered {
        queue: String,
        consumer_id: ConsumerId,
    },
    Published {
        queue: String,
        message_id: MessageId,
    },
    Acked {
        queue: String,
        message_id: MessageId,
    },
    Pong,
    Error {
        message: String,
    },
    Deliver {
        queue: String,
        message_id: MessageId,
        #[serde(with = "payload_serde")]
        payload: Bytes,
        timestamp: DateTime<Utc>,
        attempt: u32,
    },
    Reconnect {
        queue: String,
        delay_seconds: u64,
    },
    Shutdown {
        queue: String,
    },
}

impl ServerFrame {
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    /// The connection ends after this frame is written
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Reconnect { .. } | Self::Shutdown { .. })
    }
}

impl From<Outbound> for ServerFrame {
    fn from(outbound: Outbound) -> Self {
        match outbound {
            Outbound::Deliver(d) => Self::Deliver {
                queue: d.queue,
                message_id: d.message_id,
                payload: d.payload,
                timestamp: d.timestamp,
                attempt: d.attempt,
            },
            Outbound::Reconnect { queue, delay } => Self::Reconnect {
                queue,
                delay_seconds: delay.as_secs(),
            },
            Outbound::Shutdown { queue } => Self::Shutdown { queue },
        }
    }
}

pub fn decode(line: &str) -> serde_json::Result<ClientFrame> {
    serde_json::from_str(line.trim())
}

pub fn encode(frame: &ServerFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pulsemq_core::Delivery;

    use super::*;

    #[test]
    fn test_decode_register_without_consumer_id() {
        let frame = decode(r#"{"type":"register","queue":"orders"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Register {
                queue: "orders".into(),
                consumer_id: None
            }
        );
    }

    #[test]
    fn test_decode_publish_text_and_binary() {
        let text = decode(r#"{"type":"publish","queue":"orders","payload":"hello"}"#).unwrap();
        match text {
            ClientFrame::Publish { payload, message_id, .. } => {
                assert_eq!(payload.as_ref(), b"hello");
                assert!(message_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let binary = decode(r#"{"type":"publish","queue":"orders","payload":{"base64":"AAEC"}}"#).unwrap();
        match binary {
            ClientFrame::Publish { payload, .. } => assert_eq!(payload.as_ref(), &[0u8, 1, 2]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_ack_and_ping() {
        let id = MessageId::new();
        let line = format!(r#"{{"type":"ack","queue":"orders","message_id":"{id}"}}"#);
        assert_eq!(
            decode(&line).unwrap(),
            ClientFrame::Ack {
                queue: "orders".into(),
                message_id: id
            }
        );
        assert_eq!(decode("{\"type\":\"ping\"}\r\n").unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"type":"subscribe","queue":"orders"}"#).is_err());
        assert!(decode(r#"{"type":"ack","queue":"orders","message_id":"nope"}"#).is_err());
        assert!(decode(r#"{"type":"publish","queue":"orders""#).is_err());
    }

    #[test]
    fn test_outbound_conversion() {
        let id = MessageId::new();
        let now = Utc::now();
        let frame = ServerFrame::from(Outbound::Deliver(Delivery {
            queue: "orders".into(),
            message_id: id,
            payload: Bytes::from_static(b"body"),
            timestamp: now,
            attempt: 1,
        }));
        let json: serde_json::Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(json["type"], "deliver");
        assert_eq!(json["payload"], "body");
        assert_eq!(json["message_id"], id.to_string());

        let reconnect = ServerFrame::from(Outbound::Reconnect {
            queue: "orders".into(),
            delay: Duration::from_secs(30),
        });
        assert!(reconnect.closes_connection());
        assert_eq!(
            encode(&reconnect).unwrap(),
            r#"{"type":"reconnect","queue":"orders","delay_seconds":30}"#
        );
    }
}
