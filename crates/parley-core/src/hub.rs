//! Shared signaling state and the operations over it.
//!
//! The [`Hub`] owns the registry, router and call store. Every connection
//! loop and every HTTP handler goes through it, so delivery failures and
//! disconnects all funnel into one cleanup path.

use crate::call::{now_millis, CallId, CallSession};
use crate::error::CallError;
use crate::registry::{ConnectionHandle, Registry};
use crate::router::{Delivery, Router, RouterStats};
use crate::store::{CallStore, Transition, DEFAULT_RETENTION};
use parley_protocol::{CallDecision, CallKind, ChatMessage, ServerEvent, UserId};
use parley_transport::ConnectionId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// How long terminal call sessions stay queryable.
    pub retention: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub online: usize,
    pub live_calls: usize,
    pub retained_calls: usize,
    pub router: RouterStats,
}

/// Presence, routing and call sessions.
#[derive(Debug)]
pub struct Hub {
    registry: Arc<Registry>,
    router: Router,
    calls: CallStore,
    config: HubConfig,
    next_message_id: AtomicU64,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            router: Router::new(Arc::clone(&registry)),
            calls: CallStore::with_retention(config.retention),
            registry,
            config,
            next_message_id: AtomicU64::new(0),
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The call session store.
    #[must_use]
    pub fn calls(&self) -> &CallStore {
        &self.calls
    }

    /// Register a connection for an identity.
    ///
    /// Returns the handle for cleanup and the receiving end of the outbound
    /// queue, which the connection's writer must drain. A previous connection
    /// of the same identity stops receiving routed traffic.
    pub fn connect(
        &self,
        user: UserId,
        connection: ConnectionId,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let handle = Arc::new(ConnectionHandle::new(user, connection, tx));
        self.registry.register(Arc::clone(&handle));
        info!(user = user, connection = %connection, "User connected");
        (handle, rx)
    }

    /// Whether an identity has a live connection.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.registry.is_online(user)
    }

    /// Deliver an envelope to an identity.
    ///
    /// Returns whether a connection was found. A broken connection is cleaned
    /// up on the spot and reported as not delivered.
    pub fn deliver(&self, user: UserId, event: ServerEvent) -> bool {
        match self.router.route(user, event) {
            Delivery::Broken(handle) => {
                self.disconnect(&handle);
                false
            }
            delivery => delivery.found(),
        }
    }

    fn notify(&self, transition: &Transition) {
        self.deliver(transition.notify, transition.event.clone());
    }

    /// Start ringing `callee` on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// [`CallError::SelfCall`] if both identities are the same and
    /// [`CallError::Offline`] if the callee has no live connection. No
    /// session exists afterwards in either case, and nothing is delivered
    /// to the caller.
    ///
    /// A callee whose outbound queue is full still gets a ringing session;
    /// the `incoming_call` is dropped like any other envelope to a slow
    /// consumer.
    pub fn initiate(
        &self,
        caller: UserId,
        callee: UserId,
        kind: CallKind,
    ) -> Result<CallSession, CallError> {
        if caller == callee {
            return Err(CallError::SelfCall);
        }
        if !self.is_online(callee) {
            return Err(CallError::Offline(callee));
        }

        let session = self.calls.create(caller, callee, kind);
        let event = ServerEvent::IncomingCall {
            call_id: session.id.to_string(),
            caller,
            kind,
        };
        // The session must be gone before any cleanup cascade can see it
        match self.router.route(callee, event) {
            Delivery::Delivered => {}
            Delivery::Dropped => {
                warn!(call = %session.id, callee = callee, "Incoming call not enqueued, callee queue full");
            }
            Delivery::Offline => {
                self.calls.discard(&session.id);
                return Err(CallError::Offline(callee));
            }
            Delivery::Broken(handle) => {
                self.calls.discard(&session.id);
                self.disconnect(&handle);
                return Err(CallError::Offline(callee));
            }
        }

        info!(call = %session.id, caller = caller, callee = callee, kind = %kind, "Call ringing");
        Ok(session)
    }

    /// Accept or reject a ringing call as its callee.
    ///
    /// # Errors
    ///
    /// See [`CallStore::respond`]. Nothing is delivered on failure.
    pub fn respond(
        &self,
        id: &CallId,
        user: UserId,
        decision: CallDecision,
    ) -> Result<CallSession, CallError> {
        let transition = self.calls.respond(id, user, decision)?;
        self.notify(&transition);
        info!(call = %id, user = user, status = %transition.session.status, "Call answered");
        Ok(transition.session)
    }

    /// End or cancel a call as one of its participants.
    ///
    /// # Errors
    ///
    /// See [`CallStore::end`]. Nothing is delivered on failure.
    pub fn end(&self, id: &CallId, user: UserId) -> Result<CallSession, CallError> {
        let transition = self.calls.end(id, user)?;
        self.notify(&transition);
        info!(call = %id, user = user, "Call ended");
        Ok(transition.session)
    }

    /// Live calls of an identity, oldest first.
    #[must_use]
    pub fn active_calls(&self, user: UserId) -> Vec<CallSession> {
        self.calls.active_for(user)
    }

    /// Look up a call session, terminal ones included while retained.
    #[must_use]
    pub fn call(&self, id: &CallId) -> Option<CallSession> {
        self.calls.get(id)
    }

    /// Run disconnect cleanup for one physical connection.
    ///
    /// The first call deregisters the connection and ends every live call of
    /// its identity; later calls for the same connection do nothing. A
    /// connection already superseded by a newer one of the same identity
    /// leaves the registry and the calls alone.
    ///
    /// Returns `true` if this call performed the cascade.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        if !handle.mark_closed() {
            return false;
        }

        let user = handle.user();
        if !self.registry.deregister_connection(user, handle.id()) {
            debug!(user = user, connection = %handle.id(), "Superseded connection closed");
            return false;
        }

        let ended = self.calls.end_all_for(user);
        for transition in &ended {
            self.notify(transition);
        }
        info!(
            user = user,
            connection = %handle.id(),
            ended_calls = ended.len(),
            "User disconnected"
        );
        true
    }

    /// Run disconnect cleanup for an identity's current connection.
    ///
    /// The connection's loop observes the closed handle and stops.
    pub fn disconnect_user(&self, user: UserId) -> bool {
        match self.registry.get(user) {
            Some(handle) => self.disconnect(&handle),
            None => false,
        }
    }

    /// Push a chat message to its receiver.
    ///
    /// Returns the message and whether it was delivered live.
    pub fn send_chat(
        &self,
        sender: UserId,
        receiver: UserId,
        content: impl Into<String>,
        sender_username: Option<String>,
    ) -> (ChatMessage, bool) {
        let message = ChatMessage {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1,
            content: content.into(),
            sender_id: sender,
            receiver_id: receiver,
            timestamp: now_millis(),
            sender_username,
        };
        let delivered = self.deliver(
            receiver,
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        debug!(
            sender = sender,
            receiver = receiver,
            message = message.id,
            delivered = delivered,
            "Chat message"
        );
        (message, delivered)
    }

    /// Evict terminal sessions past their retention.
    pub fn prune_terminal(&self) -> usize {
        self.calls.prune_terminal(now_millis())
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let live_calls = self.calls.live_count();
        HubStats {
            online: self.registry.len(),
            live_calls,
            retained_calls: self.calls.len().saturating_sub(live_calls),
            router: self.router.stats(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
