//! Per-connection signaling loop.
//!
//! One [`ConnectionLoop`] runs for the lifetime of one connection. It writes
//! routed envelopes from the connection's outbound queue, dispatches inbound
//! envelopes to the [`Hub`], and runs disconnect cleanup exactly once when
//! the connection ends.

use crate::call::CallId;
use crate::hub::Hub;
use crate::registry::ConnectionHandle;
use parley_protocol::{CallDecision, ClientEvent, ServerEvent, UserId};
use parley_transport::{Connection, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Handler configuration.
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    /// Close the connection after this long without inbound traffic.
    pub idle_timeout: Option<Duration>,
}

/// Why a connection loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the channel.
    ClientClosed,
    /// Reading from the channel failed.
    TransportError,
    /// Nothing was received within the idle timeout.
    Idle,
    /// Writing to the channel failed.
    SendFailed,
    /// The hub closed the connection's handle.
    Evicted,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::Idle => "idle",
            CloseReason::SendFailed => "send_failed",
            CloseReason::Evicted => "evicted",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signaling loop of one registered connection.
pub struct ConnectionLoop<C> {
    hub: Arc<Hub>,
    handle: Arc<ConnectionHandle>,
    outbound: mpsc::Receiver<ServerEvent>,
    conn: C,
    config: HandlerConfig,
}

impl<C: Connection> ConnectionLoop<C> {
    /// Register `conn` as the live connection of `user`.
    ///
    /// The identity is reachable through the hub as soon as this returns,
    /// before [`run`](Self::run) is polled.
    pub fn open(hub: Arc<Hub>, user: UserId, conn: C, config: HandlerConfig) -> Self {
        let (handle, outbound) = hub.connect(user, conn.id());
        Self {
            hub,
            handle,
            outbound,
            conn,
            config,
        }
    }

    /// The identity bound to this loop.
    #[must_use]
    pub fn user(&self) -> UserId {
        self.handle.user()
    }

    /// The registry handle of this connection.
    #[must_use]
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Run until the connection ends, then clean up.
    pub async fn run(mut self) -> CloseReason {
        let user = self.user();
        let mut last_inbound = Instant::now();

        let reason = loop {
            let deadline = self.config.idle_timeout.map(|timeout| last_inbound + timeout);

            tokio::select! {
                biased;

                Some(event) = self.outbound.recv() => {
                    if let Err(e) = self.conn.send(&event).await {
                        warn!(user = user, connection = %self.conn.id(), error = %e, "Send failed");
                        break CloseReason::SendFailed;
                    }
                }

                () = self.handle.closed() => break CloseReason::Evicted,

                result = self.conn.recv() => match result {
                    Ok(Some(event)) => {
                        last_inbound = Instant::now();
                        if let Err(reason) = self.dispatch(event).await {
                            break reason;
                        }
                    }
                    Ok(None) => break CloseReason::ClientClosed,
                    Err(TransportError::Protocol(e)) => {
                        last_inbound = Instant::now();
                        debug!(user = user, error = %e, "Malformed event");
                        let reply = ServerEvent::error(e.code(), e.to_string());
                        if self.conn.send(&reply).await.is_err() {
                            break CloseReason::SendFailed;
                        }
                    }
                    Err(e) => {
                        warn!(user = user, connection = %self.conn.id(), error = %e, "Receive failed");
                        break CloseReason::TransportError;
                    }
                },

                () = idle(deadline) => break CloseReason::Idle,
            }
        };

        self.hub.disconnect(&self.handle);
        if let Err(e) = self.conn.close().await {
            debug!(user = user, error = %e, "Close failed");
        }
        info!(
            user = user,
            connection = %self.conn.id(),
            remote = ?self.conn.remote_addr(),
            reason = %reason,
            "Connection closed"
        );
        reason
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), CloseReason> {
        let user = self.user();
        trace!(user = user, event = event.event_type(), "Inbound event");

        match event {
            ClientEvent::Ping { timestamp } => {
                if self.conn.send(&ServerEvent::pong(timestamp)).await.is_err() {
                    return Err(CloseReason::SendFailed);
                }
            }
            ClientEvent::Typing { recipient_id } => {
                if let Some(recipient) = recipient_id {
                    self.hub.deliver(recipient, ServerEvent::Typing { user_id: user });
                }
            }
            ClientEvent::WebrtcSignal {
                recipient,
                payload,
                mut extra,
            } => {
                if let Some(recipient) = recipient {
                    // The sender is always the authenticated identity
                    extra.remove("sender");
                    let delivered = self.hub.deliver(
                        recipient,
                        ServerEvent::WebrtcSignal {
                            sender: user,
                            payload,
                            extra,
                        },
                    );
                    if !delivered {
                        debug!(user = user, recipient = recipient, "Signal dropped, recipient offline");
                    }
                }
            }
            ClientEvent::CallResponse { call_id, response } => {
                self.answer(call_id, response);
            }
        }
        Ok(())
    }

    fn answer(&self, call_id: Option<String>, response: Option<String>) {
        let user = self.user();
        let (Some(call_id), Some(response)) = (call_id, response) else {
            debug!(user = user, "Incomplete call response ignored");
            return;
        };
        let decision = match response.parse::<CallDecision>() {
            Ok(decision) => decision,
            Err(e) => {
                debug!(user = user, error = %e, "Call response ignored");
                return;
            }
        };
        if let Err(e) = self.hub.respond(&CallId::from(call_id), user, decision) {
            debug!(user = user, error = %e, "Call response ignored");
        }
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Register `conn` for `user` and run its loop to completion.
pub async fn serve<C: Connection>(
    hub: Arc<Hub>,
    user: UserId,
    conn: C,
    config: HandlerConfig,
) -> CloseReason {
    ConnectionLoop::open(hub, user, conn, config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::codes;
    use parley_transport::memory;

    #[tokio::test]
    async fn test_ping_pong_echoes_timestamp() {
        let hub = Arc::new(Hub::new());
        let (conn, mut peer) = memory::pair();
        let task = tokio::spawn(serve(hub.clone(), 1, conn, HandlerConfig::default()));

        peer.send(&ClientEvent::Ping { timestamp: Some(42) });
        assert_eq!(peer.recv().await, Some(ServerEvent::pong(Some(42))));

        peer.disconnect();
        assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
        assert!(!hub.is_online(1));
    }

    #[tokio::test]
    async fn test_open_registers_before_run() {
        let hub = Arc::new(Hub::new());
        let (conn, _peer) = memory::pair();

        let connection = ConnectionLoop::open(hub.clone(), 5, conn, HandlerConfig::default());
        assert!(hub.is_online(5));
        assert_eq!(connection.user(), 5);
        assert!(!connection.handle().is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_answers_error() {
        let hub = Arc::new(Hub::new());
        let (conn, mut peer) = memory::pair();
        tokio::spawn(serve(hub, 1, conn, HandlerConfig::default()));

        peer.send_raw("not json");
        peer.send_raw(r#"{"type":"teleport"}"#);
        peer.send(&ClientEvent::Ping { timestamp: None });

        for _ in 0..2 {
            match peer.recv().await {
                Some(ServerEvent::Error { code, .. }) => assert_eq!(code, codes::MALFORMED),
                other => panic!("Expected error, got {:?}", other),
            }
        }
        assert_eq!(peer.recv().await, Some(ServerEvent::pong(None)));
    }

    #[tokio::test]
    async fn test_bad_call_responses_are_ignored() {
        let hub = Arc::new(Hub::new());
        let (conn, mut peer) = memory::pair();
        tokio::spawn(serve(hub, 1, conn, HandlerConfig::default()));

        peer.send_raw(r#"{"type":"call_response"}"#);
        peer.send_raw(r#"{"type":"call_response","callId":"call_9_1_1","response":"accept"}"#);
        peer.send_raw(r#"{"type":"call_response","callId":"call_9_1_1","response":"shrug"}"#);
        peer.send(&ClientEvent::Ping { timestamp: Some(1) });

        assert_eq!(peer.recv().await, Some(ServerEvent::pong(Some(1))));
    }

    #[tokio::test]
    async fn test_disconnect_user_stops_loop() {
        let hub = Arc::new(Hub::new());
        let (conn, mut peer) = memory::pair();
        let connection = ConnectionLoop::open(hub.clone(), 1, conn, HandlerConfig::default());
        let task = tokio::spawn(connection.run());

        assert!(hub.disconnect_user(1));
        assert_eq!(task.await.unwrap(), CloseReason::Evicted);
        assert!(!hub.is_online(1));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_and_cleans_up() {
        let hub = Arc::new(Hub::new());
        let (conn, _peer) = memory::pair();
        let config = HandlerConfig {
            idle_timeout: Some(Duration::from_secs(30)),
        };

        let connection = ConnectionLoop::open(hub.clone(), 1, conn, config);
        assert!(hub.is_online(1));
        assert_eq!(connection.run().await, CloseReason::Idle);
        assert!(!hub.is_online(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_resets_idle_deadline() {
        let hub = Arc::new(Hub::new());
        let (conn, mut peer) = memory::pair();
        let config = HandlerConfig {
            idle_timeout: Some(Duration::from_secs(30)),
        };
        let task = tokio::spawn(serve(hub.clone(), 1, conn, config));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            peer.send(&ClientEvent::Ping { timestamp: None });
            assert_eq!(peer.recv().await, Some(ServerEvent::pong(None)));
        }
        assert!(hub.is_online(1));

        assert_eq!(task.await.unwrap(), CloseReason::Idle);
        assert!(!hub.is_online(1));
    }
}
