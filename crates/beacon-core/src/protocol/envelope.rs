//! JSON wire envelope.
//!
//! Every message travels as one flat JSON object:
//!
//! ```text
//! {"type":"heartbeat","senderId":"k3j9x0a1b","timestamp":1700000000000,"leaderId":"a0c4e8f2d"}
//! {"type":"leader_elected","senderId":"k3j9x0a1b","timestamp":1700000000000,"leaderId":"a0c4e8f2d"}
//! {"type":"message_to_leader","senderId":"...","timestamp":...,"messageType":"ping","payload":{}}
//! {"type":"job_done","senderId":"...","timestamp":...,"payload":{"id":7}}
//! ```
//!
//! Decoding validates the per-kind schema; anything that does not fit is a
//! [`ProtocolError`] and the caller drops the message.

use super::message::{Message, MessageBody, MessageKind};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum encoded message size accepted or produced (64KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message of kind {kind} is missing field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Message type cannot be empty")]
    EmptyMessageType,

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

/// Flat wire representation shared by all kinds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    sender_id: PeerId,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    leader_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl From<&Message> for WireEnvelope {
    fn from(msg: &Message) -> Self {
        let mut envelope = WireEnvelope {
            kind: msg.kind().as_str().to_string(),
            sender_id: msg.sender_id.clone(),
            timestamp: msg.timestamp,
            leader_id: None,
            message_type: None,
            payload: None,
        };

        match &msg.body {
            MessageBody::Heartbeat { leader_id } | MessageBody::Announce { leader_id } => {
                envelope.leader_id = leader_id.clone();
            }
            MessageBody::LeaderElected { leader_id } => {
                envelope.leader_id = Some(leader_id.clone());
            }
            MessageBody::MessageToLeader {
                message_type,
                payload,
            } => {
                envelope.message_type = Some(message_type.clone());
                envelope.payload = Some(payload.clone());
            }
            MessageBody::Application { payload, .. } => {
                envelope.payload = Some(payload.clone());
            }
            MessageBody::RequestStatus | MessageBody::TabLeft => {}
        }

        envelope
    }
}

impl TryFrom<WireEnvelope> for Message {
    type Error = ProtocolError;

    fn try_from(envelope: WireEnvelope) -> Result<Self, Self::Error> {
        let kind: MessageKind = match envelope.kind.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        };

        let body = match kind {
            MessageKind::Heartbeat => MessageBody::Heartbeat {
                leader_id: envelope.leader_id,
            },
            MessageKind::Announce => MessageBody::Announce {
                leader_id: envelope.leader_id,
            },
            MessageKind::RequestStatus => MessageBody::RequestStatus,
            MessageKind::TabLeft => MessageBody::TabLeft,
            MessageKind::LeaderElected => MessageBody::LeaderElected {
                leader_id: envelope.leader_id.ok_or(ProtocolError::MissingField {
                    kind: "leader_elected",
                    field: "leaderId",
                })?,
            },
            MessageKind::MessageToLeader => {
                let message_type = envelope.message_type.ok_or(ProtocolError::MissingField {
                    kind: "message_to_leader",
                    field: "messageType",
                })?;
                if message_type.is_empty() {
                    return Err(ProtocolError::EmptyMessageType);
                }
                MessageBody::MessageToLeader {
                    message_type,
                    payload: envelope.payload.unwrap_or(Value::Null),
                }
            }
            MessageKind::Application(message_type) => {
                if message_type.is_empty() {
                    return Err(ProtocolError::EmptyMessageType);
                }
                MessageBody::Application {
                    message_type,
                    payload: envelope.payload.unwrap_or(Value::Null),
                }
            }
        };

        Ok(Message::new(envelope.sender_id, envelope.timestamp, body))
    }
}

impl Message {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(&WireEnvelope::from(self))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Parse and validate JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        let envelope: WireEnvelope = serde_json::from_slice(data)?;
        Message::try_from(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> PeerId {
        "k3j9x0a1b".parse().unwrap()
    }

    fn leader() -> PeerId {
        "a0c4e8f2d".parse().unwrap()
    }

    fn wire(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_leader_elected_wire_format() {
        let msg = Message::leader_elected(sender(), 1234, leader());
        let value: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "leader_elected",
                "senderId": "k3j9x0a1b",
                "timestamp": 1234,
                "leaderId": "a0c4e8f2d"
            })
        );
    }

    #[test]
    fn test_message_to_leader_wire_format() {
        let msg = Message::message_to_leader(sender(), 5, "ping", json!({"n": 1}));
        let value: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "message_to_leader");
        assert_eq!(value["messageType"], "ping");
        assert_eq!(value["payload"], json!({"n": 1}));
        assert!(value.get("leaderId").is_none());
    }

    #[test]
    fn test_heartbeat_without_leader_has_no_extra_fields() {
        let msg = Message::heartbeat(sender(), 9, None);
        let value: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_heartbeat_carries_leader() {
        let msg = Message::heartbeat(sender(), 9, Some(leader()));
        let value: Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["leaderId"], "a0c4e8f2d");

        // Older peers omit the field
        let msg = Message::from_json(&wire(json!({
            "type": "announce",
            "senderId": "k3j9x0a1b",
            "timestamp": 10
        })))
        .unwrap();
        assert_eq!(msg.body, MessageBody::Announce { leader_id: None });
    }

    #[test]
    fn test_decode_application_message() {
        let msg = Message::from_json(&wire(json!({
            "type": "job_done",
            "senderId": "k3j9x0a1b",
            "timestamp": 10,
            "payload": {"id": 7}
        })))
        .unwrap();

        assert_eq!(
            msg.body,
            MessageBody::Application {
                message_type: "job_done".into(),
                payload: json!({"id": 7})
            }
        );
    }

    #[test]
    fn test_decode_application_without_payload() {
        let msg = Message::from_json(&wire(json!({
            "type": "refresh",
            "senderId": "k3j9x0a1b",
            "timestamp": 10
        })))
        .unwrap();

        assert_eq!(msg.body, MessageBody::application("refresh", Value::Null));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let msg = Message::from_json(&wire(json!({
            "type": "heartbeat",
            "senderId": "k3j9x0a1b",
            "timestamp": 10,
            "extra": true
        })))
        .unwrap();
        assert_eq!(msg.body, MessageBody::Heartbeat { leader_id: None });
    }

    #[test]
    fn test_reject_leader_elected_without_leader() {
        let err = Message::from_json(&wire(json!({
            "type": "leader_elected",
            "senderId": "k3j9x0a1b",
            "timestamp": 10
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "leaderId", .. }));
    }

    #[test]
    fn test_reject_message_to_leader_without_type() {
        let err = Message::from_json(&wire(json!({
            "type": "message_to_leader",
            "senderId": "k3j9x0a1b",
            "timestamp": 10,
            "payload": {}
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "messageType", .. }));
    }

    #[test]
    fn test_reject_bad_sender() {
        let err = Message::from_json(&wire(json!({
            "type": "heartbeat",
            "senderId": "",
            "timestamp": 10
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_reject_missing_sender() {
        assert!(Message::from_json(&wire(json!({"type": "heartbeat", "timestamp": 1}))).is_err());
    }

    #[test]
    fn test_reject_non_json() {
        assert!(Message::from_json(b"\x00\x01binary").is_err());
        assert!(Message::from_json(b"[1,2,3]").is_err());
    }

    #[test]
    fn test_reject_empty_type() {
        let err = Message::from_json(&wire(json!({
            "type": "",
            "senderId": "k3j9x0a1b",
            "timestamp": 1
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyMessageType));
    }

    #[test]
    fn test_reject_oversized() {
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Message::from_json(&big),
            Err(ProtocolError::TooLarge(_))
        ));

        let msg = Message::new(
            sender(),
            1,
            MessageBody::application("blob", json!("x".repeat(MAX_MESSAGE_SIZE))),
        );
        assert!(matches!(msg.to_json(), Err(ProtocolError::TooLarge(_))));
    }

    #[test]
    fn test_roundtrip_all_protocol_kinds() {
        let messages = vec![
            Message::heartbeat(sender(), 1, Some(leader())),
            Message::announce(sender(), 2, None),
            Message::request_status(sender(), 3),
            Message::leader_elected(sender(), 4, leader()),
            Message::message_to_leader(sender(), 5, "ping", json!([1, 2])),
            Message::tab_left(sender(), 6),
        ];
        for msg in messages {
            let parsed = Message::from_json(&msg.to_json().unwrap()).unwrap();
            assert_eq!(parsed, msg);
        }
    }
}
