//! # parley-protocol
//!
//! Event envelopes exchanged between Parley clients and the signaling server.
//!
//! Every envelope is a structured object with a `type` discriminator and a
//! type-specific payload. Text frames carry JSON, binary frames carry
//! MessagePack of the same shape.
//!
//! ## Inbound
//!
//! - `ping` - Liveness probe, answered with `pong`
//! - `typing` - Typing indicator for a chat peer
//! - `webrtc_signal` - Offer/answer/candidate relayed to a peer
//! - `call_response` - Accept or reject a ringing call
//!
//! ## Outbound
//!
//! `pong`, `typing`, `webrtc_signal`, `incoming_call`, `call_accepted`,
//! `call_rejected`, `call_ended`, `error`, `new_message`.
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode_text(r#"{"type":"typing","recipientId":2}"#).unwrap();
//! assert_eq!(event, ClientEvent::Typing { recipient_id: Some(2) });
//! ```

pub mod codec;
pub mod events;

pub use codec::{Encoded, Encoding, ProtocolError};
pub use events::{
    codes, CallDecision, CallKind, ChatMessage, ClientEvent, InvalidValue, ServerEvent, UserId,
};
