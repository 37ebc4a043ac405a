//! In-process transport.
//!
//! A [`MemoryConnection`] behaves like a WebSocket carrying JSON text frames;
//! its [`MemoryPeer`] plays the client. Used by tests and by embedders that
//! drive the signaling loop without a network.

use async_trait::async_trait;
use parley_protocol::{codec, ClientEvent, ServerEvent};
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, TransportError};

/// Create a connected server/client pair.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: inbound_rx,
        outbound: outbound_tx,
        closed: false,
    };
    let peer = MemoryPeer {
        frames: Some(inbound_tx),
        events: outbound_rx,
    };
    (conn, peer)
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    closed: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(text) => Ok(Some(codec::decode_text(&text)?)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(event.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.inbound.close();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    frames: Option<mpsc::UnboundedSender<String>>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl MemoryPeer {
    /// Send an envelope. Returns `false` if the server side is gone.
    pub fn send(&self, event: &ClientEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    /// Send a raw text frame, well-formed or not.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.frames
            .as_ref()
            .map(|tx| tx.send(text.into()).is_ok())
            .unwrap_or(false)
    }

    /// Wait for the next envelope from the server.
    ///
    /// Returns `None` once the server side is dropped.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Take an already delivered envelope, if any.
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Close the client side; the server observes a clean end of stream.
    pub fn disconnect(&mut self) {
        self.frames = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (mut conn, mut peer) = pair();

        assert!(peer.send(&ClientEvent::Ping { timestamp: Some(3) }));
        let event = conn.recv().await.unwrap();
        assert_eq!(event, Some(ClientEvent::Ping { timestamp: Some(3) }));

        conn.send(&ServerEvent::pong(Some(3))).await.unwrap();
        assert_eq!(peer.recv().await, Some(ServerEvent::pong(Some(3))));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let (mut conn, peer) = pair();

        peer.send_raw("{oops");
        peer.send(&ClientEvent::Ping { timestamp: None });

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert!(conn.recv().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let (mut conn, mut peer) = pair();
        peer.disconnect();
        assert!(conn.recv().await.unwrap().is_none());
        assert!(!peer.send_raw("{}"));
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_fails() {
        let (mut conn, peer) = pair();
        drop(peer);
        let result = conn.send(&ServerEvent::pong(None)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
