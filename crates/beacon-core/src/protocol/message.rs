//! Typed protocol messages.
//!
//! Each message kind carries its own payload schema. Application-defined
//! kinds carry an opaque JSON payload that handlers deserialize themselves.

use crate::PeerId;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kinds of messages on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Announce,
    RequestStatus,
    LeaderElected,
    MessageToLeader,
    TabLeft,
    /// Any kind not reserved by the protocol
    Application(String),
}

impl MessageKind {
    /// Wire names reserved by the protocol.
    pub const RESERVED: [&'static str; 6] = [
        "heartbeat",
        "announce",
        "request_status",
        "leader_elected",
        "message_to_leader",
        "tab_left",
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Announce => "announce",
            Self::RequestStatus => "request_status",
            Self::LeaderElected => "leader_elected",
            Self::MessageToLeader => "message_to_leader",
            Self::TabLeft => "tab_left",
            Self::Application(name) => name,
        }
    }

    /// Whether `name` is reserved for protocol use.
    pub fn is_reserved(name: &str) -> bool {
        Self::RESERVED.contains(&name)
    }
}

impl FromStr for MessageKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "heartbeat" => Self::Heartbeat,
            "announce" => Self::Announce,
            "request_status" => Self::RequestStatus,
            "leader_elected" => Self::LeaderElected,
            "message_to_leader" => Self::MessageToLeader,
            "tab_left" => Self::TabLeft,
            other => Self::Application(other.to_string()),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific message content.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Periodic liveness signal, with the sender's current leader
    Heartbeat { leader_id: Option<PeerId> },
    /// Presence announcement (bootstrap or reply to a status request)
    Announce { leader_id: Option<PeerId> },
    /// Ask every peer to announce itself
    RequestStatus,
    /// The sender elected `leader_id`
    LeaderElected { leader_id: PeerId },
    /// Application message meant only for the current leader
    MessageToLeader { message_type: String, payload: Value },
    /// Graceful departure
    TabLeft,
    /// Application-defined broadcast
    Application { message_type: String, payload: Value },
}

impl MessageBody {
    /// Build an application-defined body.
    pub fn application(message_type: impl Into<String>, payload: Value) -> Self {
        Self::Application {
            message_type: message_type.into(),
            payload,
        }
    }

    /// Leader the sender currently recognizes, for kinds that carry one.
    ///
    /// `leader_elected` counts as a claim for its announced leader.
    pub fn leader_claim(&self) -> Option<&PeerId> {
        match self {
            Self::Heartbeat { leader_id } | Self::Announce { leader_id } => leader_id.as_ref(),
            Self::LeaderElected { leader_id } => Some(leader_id),
            _ => None,
        }
    }

    /// The kind of this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Heartbeat { .. } => MessageKind::Heartbeat,
            Self::Announce { .. } => MessageKind::Announce,
            Self::RequestStatus => MessageKind::RequestStatus,
            Self::LeaderElected { .. } => MessageKind::LeaderElected,
            Self::MessageToLeader { .. } => MessageKind::MessageToLeader,
            Self::TabLeft => MessageKind::TabLeft,
            Self::Application { message_type, .. } => {
                MessageKind::Application(message_type.clone())
            }
        }
    }
}

/// A protocol message: who sent it, when, and what it says.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Originating peer
    pub sender_id: PeerId,
    /// Sender's local clock when the message was created (ms since epoch)
    pub timestamp: u64,
    /// Kind-specific content
    pub body: MessageBody,
}

impl Message {
    pub fn new(sender_id: PeerId, timestamp: u64, body: MessageBody) -> Self {
        Self {
            sender_id,
            timestamp,
            body,
        }
    }

    pub fn heartbeat(sender_id: PeerId, timestamp: u64, leader_id: Option<PeerId>) -> Self {
        Self::new(sender_id, timestamp, MessageBody::Heartbeat { leader_id })
    }

    pub fn announce(sender_id: PeerId, timestamp: u64, leader_id: Option<PeerId>) -> Self {
        Self::new(sender_id, timestamp, MessageBody::Announce { leader_id })
    }

    pub fn request_status(sender_id: PeerId, timestamp: u64) -> Self {
        Self::new(sender_id, timestamp, MessageBody::RequestStatus)
    }

    pub fn leader_elected(sender_id: PeerId, timestamp: u64, leader_id: PeerId) -> Self {
        Self::new(sender_id, timestamp, MessageBody::LeaderElected { leader_id })
    }

    pub fn message_to_leader(
        sender_id: PeerId,
        timestamp: u64,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(
            sender_id,
            timestamp,
            MessageBody::MessageToLeader {
                message_type: message_type.into(),
                payload,
            },
        )
    }

    pub fn tab_left(sender_id: PeerId, timestamp: u64) -> Self {
        Self::new(sender_id, timestamp, MessageBody::TabLeft)
    }

    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}
