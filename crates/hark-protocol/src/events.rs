//! Event types for the Hark protocol.
//!
//! Every event travels in an envelope of the form
//! `{"event": "<name>", "data": <payload>}`. Client events are what a
//! connection sends to the relay; server events are what the relay emits.
//!
//! Signaling payloads (`offer`, `answer`, `candidate`, `message`) are kept as
//! opaque [`serde_json::Value`]s and are never inspected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, announced in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;

/// Events sent by a client.
///
/// Routing fields are optional on the wire so that missing fields can be
/// reported back to the sender instead of failing decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Bind this connection to a user id.
    #[serde(rename = "register")]
    Register(Option<String>),

    /// Relay a chat message to another user.
    #[serde(rename = "private-message")]
    PrivateMessage(PrivateMessage),

    /// Ask whether a user is online.
    #[serde(rename = "status")]
    Status(Option<String>),

    /// Start a call by relaying an SDP offer.
    #[serde(rename = "call-user")]
    CallUser(CallOffer),

    /// Answer a call by relaying an SDP answer.
    #[serde(rename = "make-answer")]
    MakeAnswer(CallAnswer),

    /// Relay an ICE candidate.
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidate),
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => "register",
            ClientEvent::PrivateMessage(_) => "private-message",
            ClientEvent::Status(_) => "status",
            ClientEvent::CallUser(_) => "call-user",
            ClientEvent::MakeAnswer(_) => "make-answer",
            ClientEvent::IceCandidate(_) => "ice-candidate",
        }
    }

    /// Create a `register` event.
    #[must_use]
    pub fn register(user_id: impl Into<String>) -> Self {
        ClientEvent::Register(Some(user_id.into()))
    }

    /// Create a `status` query.
    #[must_use]
    pub fn status(user_id: impl Into<String>) -> Self {
        ClientEvent::Status(Some(user_id.into()))
    }

    /// Create a `private-message` event without an explicit sender.
    #[must_use]
    pub fn private_message(to: impl Into<String>, message: impl Into<Value>) -> Self {
        ClientEvent::PrivateMessage(PrivateMessage {
            to_user_id: Some(to.into()),
            message: Some(message.into()),
            from_user_id: None,
        })
    }

    /// Create a `call-user` event.
    #[must_use]
    pub fn call_user(to: impl Into<String>, offer: Value) -> Self {
        ClientEvent::CallUser(CallOffer {
            to: Some(to.into()),
            offer: Some(offer),
            from: None,
        })
    }

    /// Create a `make-answer` event.
    #[must_use]
    pub fn make_answer(to: impl Into<String>, answer: Value) -> Self {
        ClientEvent::MakeAnswer(CallAnswer {
            to: Some(to.into()),
            answer: Some(answer),
            from: None,
        })
    }

    /// Create an `ice-candidate` event.
    #[must_use]
    pub fn ice_candidate(to: impl Into<String>, candidate: Value) -> Self {
        ClientEvent::IceCandidate(IceCandidate {
            to: Some(to.into()),
            candidate: Some(candidate),
            from: None,
        })
    }
}

/// Payload of an inbound `private-message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrivateMessage {
    /// Recipient user id.
    pub to_user_id: Option<String>,
    /// Opaque message body.
    pub message: Option<Value>,
    /// Sender override; defaults to the registered user of the connection.
    pub from_user_id: Option<String>,
}

/// Payload of an inbound `call-user`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOffer {
    pub to: Option<String>,
    pub offer: Option<Value>,
    pub from: Option<String>,
}

/// Payload of an inbound `make-answer`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallAnswer {
    pub to: Option<String>,
    pub answer: Option<Value>,
    pub from: Option<String>,
}

/// Payload of an inbound `ice-candidate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceCandidate {
    pub to: Option<String>,
    pub candidate: Option<Value>,
    pub from: Option<String>,
}

/// Events emitted by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Sent once when a connection is accepted.
    #[serde(rename = "connected")]
    Connected(Connected),

    /// Presence broadcast or reply to a status query.
    #[serde(rename = "status")]
    Status(StatusUpdate),

    /// Delivered chat message.
    #[serde(rename = "private-message")]
    PrivateMessage(DeliveredMessage),

    /// Delivered SDP offer.
    #[serde(rename = "call-made")]
    CallMade(CallMade),

    /// Delivered SDP answer.
    #[serde(rename = "answer-made")]
    AnswerMade(AnswerMade),

    /// Delivered ICE candidate.
    #[serde(rename = "ice-candidate")]
    IceCandidate(RelayedCandidate),

    /// Validation or delivery failure, sent to the originating connection only.
    #[serde(rename = "error")]
    Error(String),
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::Status(_) => "status",
            ServerEvent::PrivateMessage(_) => "private-message",
            ServerEvent::CallMade(_) => "call-made",
            ServerEvent::AnswerMade(_) => "answer-made",
            ServerEvent::IceCandidate(_) => "ice-candidate",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Create a `connected` event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat_ms: u32) -> Self {
        ServerEvent::Connected(Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat: heartbeat_ms,
        })
    }

    /// Create a `status` event.
    #[must_use]
    pub fn status(user_id: impl Into<String>, online: bool) -> Self {
        ServerEvent::Status(StatusUpdate {
            user_id: user_id.into(),
            status: online,
        })
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(message.into())
    }
}

/// Connection established response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    /// Identifier assigned to this connection.
    pub connection_id: String,
    /// Protocol version spoken by the relay.
    pub version: u8,
    /// Heartbeat interval in milliseconds.
    pub heartbeat: u32,
}

/// Online state of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub user_id: String,
    pub status: bool,
}

/// A chat message as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMade {
    pub offer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerMade {
    pub answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedCandidate {
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}
