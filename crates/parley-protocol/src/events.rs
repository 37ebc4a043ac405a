//! Event envelopes for the Parley protocol.
//!
//! Envelopes are internally tagged on `type`. Field names are camelCase on the
//! wire; inbound fields also accept their snake_case spelling.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A user identity, as supplied by the identity collaborator.
pub type UserId = u64;

/// Error codes carried by `error` envelopes.
pub mod codes {
    /// The inbound envelope was not well-formed or lacked a known `type`.
    pub const MALFORMED: u16 = 1001;
    /// The inbound envelope exceeded the size limit.
    pub const TOO_LARGE: u16 = 1009;
    /// The server failed to encode a reply.
    pub const INTERNAL: u16 = 1011;
}

/// A textual value that does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {value:?}")]
pub struct InvalidValue {
    /// Which field was being parsed.
    pub field: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Media kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallKind {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(CallKind::Audio),
            "video" => Ok(CallKind::Video),
            _ => Err(InvalidValue {
                field: "call kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Callee's answer to a ringing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDecision {
    Accept,
    Reject,
}

impl FromStr for CallDecision {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(CallDecision::Accept),
            "reject" => Ok(CallDecision::Reject),
            _ => Err(InvalidValue {
                field: "call response",
                value: s.to_string(),
            }),
        }
    }
}

/// A chat message pushed live to its receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
}

/// An envelope sent by a client.
///
/// Identifier fields are optional and decoded leniently: a number or a
/// numeric string is accepted, anything else reads as absent. The handler
/// ignores envelopes whose target is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Liveness probe.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Typing indicator addressed to a chat peer.
    #[serde(rename_all = "camelCase")]
    Typing {
        #[serde(
            default,
            alias = "recipient_id",
            alias = "recipient",
            deserialize_with = "lenient_user_id",
            skip_serializing_if = "Option::is_none"
        )]
        recipient_id: Option<UserId>,
    },

    /// WebRTC negotiation payload to relay verbatim.
    ///
    /// Top-level fields other than the recipient travel in `extra` and are
    /// relayed alongside `payload`.
    #[serde(rename_all = "camelCase")]
    WebrtcSignal {
        #[serde(
            default,
            alias = "recipient_id",
            alias = "recipientId",
            deserialize_with = "lenient_user_id",
            skip_serializing_if = "Option::is_none"
        )]
        recipient: Option<UserId>,
        #[serde(default)]
        payload: Value,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Answer to an `incoming_call`.
    #[serde(rename_all = "camelCase")]
    CallResponse {
        #[serde(
            default,
            alias = "call_id",
            deserialize_with = "lenient_string",
            skip_serializing_if = "Option::is_none"
        )]
        call_id: Option<String>,
        #[serde(
            default,
            deserialize_with = "lenient_string",
            skip_serializing_if = "Option::is_none"
        )]
        response: Option<String>,
    },
}

impl ClientEvent {
    /// Wire name of the envelope type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::Ping { .. } => "ping",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::WebrtcSignal { .. } => "webrtc_signal",
            ClientEvent::CallResponse { .. } => "call_response",
        }
    }
}

/// An envelope sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to `ping`, echoing its timestamp.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A peer is typing.
    #[serde(rename_all = "camelCase")]
    Typing { user_id: UserId },

    /// Relayed negotiation payload.
    #[serde(rename_all = "camelCase")]
    WebrtcSignal {
        sender: UserId,
        payload: Value,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// A call is ringing for the receiver.
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call_id: String,
        caller: UserId,
        kind: CallKind,
    },

    /// The callee accepted.
    #[serde(rename_all = "camelCase")]
    CallAccepted { call_id: String, kind: CallKind },

    /// The callee rejected.
    #[serde(rename_all = "camelCase")]
    CallRejected { call_id: String },

    /// The other participant hung up, cancelled or disconnected.
    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: String, ended_by: UserId },

    /// Protocol error on the receiving connection.
    Error { code: u16, message: String },

    /// A chat message for the receiver.
    NewMessage { message: ChatMessage },
}

impl ServerEvent {
    /// Wire name of the envelope type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::WebrtcSignal { .. } => "webrtc_signal",
            ServerEvent::IncomingCall { .. } => "incoming_call",
            ServerEvent::CallAccepted { .. } => "call_accepted",
            ServerEvent::CallRejected { .. } => "call_rejected",
            ServerEvent::CallEnded { .. } => "call_ended",
            ServerEvent::Error { .. } => "error",
            ServerEvent::NewMessage { .. } => "new_message",
        }
    }

    /// Create a `pong` envelope.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerEvent::Pong { timestamp }
    }

    /// Create an `error` envelope.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

fn lenient_user_id<'de, D>(deserializer: D) -> Result<Option<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}
