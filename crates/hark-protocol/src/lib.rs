//! # hark-protocol
//!
//! Wire protocol definitions for the Hark presence and signaling relay.
//!
//! Clients and the relay exchange named events. Each event is an envelope
//! `{"event": <name>, "data": <payload>}` carried either as JSON in a text
//! frame or as length-prefixed MessagePack in a binary frame.
//!
//! ## Events
//!
//! - `register` / `status` - Presence
//! - `private-message` - Chat relay
//! - `call-user` / `make-answer` / `ice-candidate` - WebRTC signaling relay
//! - `connected` / `error` - Handshake and failures
//!
//! ## Example
//!
//! ```rust
//! use hark_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::private_message("bob", "hello");
//!
//! let text = codec::encode_json(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, Encoding, ProtocolError, WireFrame};
pub use events::{
    AnswerMade, CallAnswer, CallMade, CallOffer, ClientEvent, Connected, DeliveredMessage,
    IceCandidate, PrivateMessage, RelayedCandidate, ServerEvent, StatusUpdate, PROTOCOL_VERSION,
};
