//! Signaling router for Hark.
//!
//! The router resolves the target of a relay request through the presence
//! registry and builds the event to deliver. It never mutates presence.

use crate::ids::{ConnectionId, UserId};
use crate::presence::PresenceRegistry;
use hark_protocol::{
    AnswerMade, CallAnswer, CallMade, CallOffer, DeliveredMessage, IceCandidate, PrivateMessage,
    RelayedCandidate, ServerEvent,
};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Router errors, reported to the sending connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A required field was absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The target user has no live connection.
    #[error("User {0} is not connected")]
    NotConnected(String),
}

impl RelayError {
    /// Metric label for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MissingField(_) => "invalid",
            RelayError::NotConnected(_) => "unreachable",
        }
    }

    /// The `error` event sent back to the sender.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.to_string())
    }
}

/// Kind of relayed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Message,
    Offer,
    Answer,
    Candidate,
}

impl RelayKind {
    /// Name of the inbound field carrying the target.
    fn target_field(self) -> &'static str {
        match self {
            RelayKind::Message => "toUserId",
            _ => "to",
        }
    }

    /// Name of the inbound field carrying the payload.
    fn payload_field(self) -> &'static str {
        match self {
            RelayKind::Message => "message",
            RelayKind::Offer => "offer",
            RelayKind::Answer => "answer",
            RelayKind::Candidate => "candidate",
        }
    }

    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RelayKind::Message => "private-message",
            RelayKind::Offer => "call-user",
            RelayKind::Answer => "make-answer",
            RelayKind::Candidate => "ice-candidate",
        }
    }
}

/// A point-to-point relay request.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub kind: RelayKind,
    pub to: Option<String>,
    pub payload: Option<Value>,
    pub from: Option<String>,
}

impl From<PrivateMessage> for RelayRequest {
    fn from(msg: PrivateMessage) -> Self {
        Self {
            kind: RelayKind::Message,
            to: msg.to_user_id,
            payload: msg.message,
            from: msg.from_user_id,
        }
    }
}

impl From<CallOffer> for RelayRequest {
    fn from(offer: CallOffer) -> Self {
        Self {
            kind: RelayKind::Offer,
            to: offer.to,
            payload: offer.offer,
            from: offer.from,
        }
    }
}

impl From<CallAnswer> for RelayRequest {
    fn from(answer: CallAnswer) -> Self {
        Self {
            kind: RelayKind::Answer,
            to: answer.to,
            payload: answer.answer,
            from: answer.from,
        }
    }
}

impl From<IceCandidate> for RelayRequest {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            kind: RelayKind::Candidate,
            to: candidate.to,
            payload: candidate.candidate,
            from: candidate.from,
        }
    }
}

/// An event ready for delivery to a single connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Target user.
    pub recipient: UserId,
    /// Target connection.
    pub target: ConnectionId,
    /// Event to deliver.
    pub event: ServerEvent,
}

/// Stateless relay logic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalingRouter;

impl SignalingRouter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Route a relay request sent by `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MissingField`] if the target or payload is absent
    /// and [`RelayError::NotConnected`] if the target is offline.
    pub fn route(
        &self,
        presence: &PresenceRegistry,
        sender: &ConnectionId,
        request: RelayRequest,
    ) -> Result<Delivery, RelayError> {
        let kind = request.kind;

        let to = request
            .to
            .filter(|to| !to.is_empty())
            .ok_or(RelayError::MissingField(kind.target_field()))?;
        let payload = request
            .payload
            .filter(|payload| !is_blank(payload))
            .ok_or(RelayError::MissingField(kind.payload_field()))?;

        let target = presence
            .lookup_connection(&to)
            .cloned()
            .ok_or_else(|| RelayError::NotConnected(to.clone()))?;

        let from = request
            .from
            .filter(|from| !from.is_empty())
            .or_else(|| presence.lookup_user(sender.as_str()).map(|u| u.to_string()));

        let event = match kind {
            RelayKind::Message => ServerEvent::PrivateMessage(DeliveredMessage {
                from,
                message: payload,
            }),
            RelayKind::Offer => ServerEvent::CallMade(CallMade {
                offer: payload,
                from,
            }),
            RelayKind::Answer => ServerEvent::AnswerMade(AnswerMade {
                answer: payload,
                from,
            }),
            RelayKind::Candidate => ServerEvent::IceCandidate(RelayedCandidate {
                candidate: payload,
                from,
            }),
        };

        trace!(
            kind = kind.as_str(),
            sender = %sender,
            target = %target,
            to = %to,
            "Routed relay"
        );

        Ok(Delivery {
            recipient: UserId::from(to),
            target,
            event,
        })
    }
}

/// Whether a payload counts as missing.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
