//! Connection registry.
//!
//! Maps each user identity to its single live connection. Registering a new
//! connection for an identity replaces the previous entry without closing the
//! previous channel; it simply stops receiving routed traffic.

use dashmap::DashMap;
use parley_protocol::{ServerEvent, UserId};
use parley_transport::ConnectionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Failure to enqueue an envelope on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The outbound queue is at capacity (slow consumer).
    #[error("Outbound queue full")]
    Full,

    /// The connection's writer is gone.
    #[error("Connection closed")]
    Closed,
}

/// Sending side of one registered connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    user: UserId,
    id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
    closed: AtomicBool,
    closing: Notify,
}

impl ConnectionHandle {
    /// Create a handle feeding the given outbound queue.
    #[must_use]
    pub fn new(user: UserId, id: ConnectionId, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            user,
            id,
            sender,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    /// The identity bound to this connection.
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    /// The physical connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] if the peer is not keeping up and
    /// [`SendError::Closed`] if the connection is gone.
    pub fn try_send(&self, event: ServerEvent) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark the connection closed.
    ///
    /// Returns `true` only for the first caller, which also wakes
    /// [`closed`](Self::closed).
    pub fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            // Stores a permit if nobody is waiting yet
            self.closing.notify_one();
        }
        first
    }

    /// Resolve once the connection has been marked closed.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.closing.notified().await;
    }

    /// Whether the connection has been marked closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Registry of live connections, one per identity.
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<UserId, Arc<ConnectionHandle>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the connection for the handle's identity.
    ///
    /// Returns the replaced handle, if any.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let user = handle.user();
        let connection = handle.id();
        let previous = self.connections.insert(user, handle);

        match &previous {
            Some(prev) => info!(
                user = user,
                connection = %connection,
                replaced = %prev.id(),
                "Connection replaced"
            ),
            None => debug!(user = user, connection = %connection, "Connection registered"),
        }

        previous
    }

    /// Remove the mapping for an identity. No-op if absent.
    pub fn deregister(&self, user: UserId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&user).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            debug!(user = user, connection = %handle.id(), "Connection deregistered");
        }
        removed
    }

    /// Remove the mapping only if it still points at the given connection.
    ///
    /// Returns `false` when the identity has since reconnected or is absent.
    pub fn deregister_connection(&self, user: UserId, connection: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(&user, |_, handle| handle.id() == connection)
            .is_some();
        if removed {
            debug!(user = user, connection = %connection, "Connection deregistered");
        }
        removed
    }

    /// Whether the identity currently has a registered connection.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.connections.contains_key(&user)
    }

    /// The current connection of an identity.
    #[must_use]
    pub fn get(&self, user: UserId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&user).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of online identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// All online identities, in ascending order.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.connections.iter().map(|e| *e.key()).collect();
        users.sort_unstable();
        users
    }
}
