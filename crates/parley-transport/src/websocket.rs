//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to [`Connection`]. Text frames are
//! decoded as JSON and binary frames as MessagePack; outbound envelopes use
//! the encoding negotiated at the handshake.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use parley_protocol::codec::{self, Encoded, Encoding, MAX_EVENT_SIZE};
use parley_protocol::{ClientEvent, ServerEvent};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

use crate::traits::{Connection, ConnectionId, TransportError};

/// A WebSocket connection.
pub struct WsConnection {
    id: ConnectionId,
    socket: WebSocket,
    encoding: Encoding,
    max_message_size: usize,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
}

impl WsConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, encoding: Encoding) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            encoding,
            max_message_size: MAX_EVENT_SIZE,
            remote_addr: None,
            is_open: true,
        }
    }

    /// Set the inbound size limit.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    let event = codec::decode_text_limited(&text, self.max_message_size)?;
                    return Ok(Some(event));
                }
                Some(Ok(Message::Binary(data))) => {
                    let event = codec::decode_binary_limited(&data, self.max_message_size)?;
                    return Ok(Some(event));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Control frames are answered by the websocket layer
                    trace!(connection = %self.id, "Control frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(connection = %self.id, error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match codec::encode(event, self.encoding)? {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(data) => Message::Binary(data.to_vec()),
        };

        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}
