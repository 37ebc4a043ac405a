//! Codec for encoding and decoding Parley envelopes.
//!
//! Text frames carry JSON. Binary frames carry MessagePack with named fields,
//! so both encodings describe the same object shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::events::{ClientEvent, InvalidValue, ServerEvent};

/// Maximum inbound envelope size (64 KiB).
pub const MAX_EVENT_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds the size limit.
    #[error("Envelope size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("Invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Invalid MessagePack envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl ProtocolError {
    /// Error code to report back in an `error` envelope.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ProtocolError::TooLarge { .. } => crate::codes::TOO_LARGE,
            ProtocolError::Encode(_) => crate::codes::INTERNAL,
            ProtocolError::Json(_) | ProtocolError::Decode(_) => crate::codes::MALFORMED,
        }
    }
}

/// Outbound encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl FromStr for Encoding {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            _ => Err(InvalidValue {
                field: "encoding",
                value: s.to_string(),
            }),
        }
    }
}

/// An encoded envelope, ready to be written as a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded envelope in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Whether the encoded envelope is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode an outbound envelope with the given encoding.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent, encoding: Encoding) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Json => encode_json(event).map(Encoded::Text),
        Encoding::MessagePack => encode_msgpack(event).map(Encoded::Binary),
    }
}

/// Encode an outbound envelope as JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Encode an outbound envelope as MessagePack.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_msgpack(event: &ServerEvent) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(event)?))
}

/// Decode an inbound envelope from a text frame.
///
/// # Errors
///
/// Returns an error if the text is too large, not JSON, or lacks a known `type`.
pub fn decode_text(text: &str) -> Result<ClientEvent, ProtocolError> {
    decode_text_limited(text, MAX_EVENT_SIZE)
}

/// Decode an inbound envelope from a text frame with an explicit size limit.
///
/// # Errors
///
/// Returns an error if the text is too large, not JSON, or lacks a known `type`.
pub fn decode_text_limited(text: &str, max: usize) -> Result<ClientEvent, ProtocolError> {
    check_size(text.len(), max)?;
    Ok(serde_json::from_str(text)?)
}

/// Decode an inbound envelope from a binary frame.
///
/// # Errors
///
/// Returns an error if the data is too large, not MessagePack, or lacks a known `type`.
pub fn decode_binary(data: &[u8]) -> Result<ClientEvent, ProtocolError> {
    decode_binary_limited(data, MAX_EVENT_SIZE)
}

/// Decode an inbound envelope from a binary frame with an explicit size limit.
///
/// # Errors
///
/// Returns an error if the data is too large, not MessagePack, or lacks a known `type`.
pub fn decode_binary_limited(data: &[u8], max: usize) -> Result<ClientEvent, ProtocolError> {
    check_size(data.len(), max)?;
    Ok(rmp_serde::from_slice(data)?)
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::TooLarge { size, max });
    }
    Ok(())
}
