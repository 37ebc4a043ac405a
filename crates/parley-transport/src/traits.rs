//! Transport abstraction traits for Parley.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the signaling loop to be transport-agnostic.

use async_trait::async_trait;
use parley_protocol::{ClientEvent, ProtocolError, ServerEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Unique identifier for a physical connection.
///
/// Identities may reconnect; the connection id tells two channels of the same
/// identity apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer sent an envelope that could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// An active connection over a transport.
///
/// Connections handle the bidirectional flow of envelopes between the server
/// and a single client. `recv` must be cancel-safe: the signaling loop races
/// it against outbound traffic.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> ConnectionId;

    /// Receive the next envelope from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly. A
    /// [`TransportError::Protocol`] error means one envelope was rejected and
    /// the connection is still readable.
    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError>;

    /// Send an envelope to the connection.
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
