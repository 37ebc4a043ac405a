//! Message router for Parley.
//!
//! Resolves an identity through the registry at send time and enqueues the
//! envelope on that connection. Delivery is fire-and-forget: a found
//! connection counts as delivered whether or not the peer ever reads it.

use crate::registry::{ConnectionHandle, Registry, SendError};
use parley_protocol::{ServerEvent, UserId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Outcome of routing one envelope.
#[derive(Debug)]
pub enum Delivery {
    /// Enqueued on the identity's connection.
    Delivered,
    /// The identity has no registered connection.
    Offline,
    /// The connection exists but its queue is full; the envelope was dropped.
    Dropped,
    /// The connection is broken; the caller must run disconnect cleanup.
    Broken(Arc<ConnectionHandle>),
}

impl Delivery {
    /// Whether a connection was found for the identity.
    #[must_use]
    pub fn found(&self) -> bool {
        matches!(self, Delivery::Delivered | Delivery::Dropped)
    }
}

/// The envelope router.
#[derive(Debug)]
pub struct Router {
    registry: Arc<Registry>,
    delivered: AtomicU64,
    offline: AtomicU64,
    dropped: AtomicU64,
    broken: AtomicU64,
}

impl Router {
    /// Create a router over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            delivered: AtomicU64::new(0),
            offline: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            broken: AtomicU64::new(0),
        }
    }

    /// The registry this router resolves identities against.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Route an envelope to an identity.
    pub fn route(&self, user: UserId, event: ServerEvent) -> Delivery {
        let Some(handle) = self.registry.get(user) else {
            self.offline.fetch_add(1, Ordering::Relaxed);
            trace!(user = user, event = event.event_type(), "Recipient offline");
            return Delivery::Offline;
        };

        let event_type = event.event_type();
        match handle.try_send(event) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                trace!(user = user, connection = %handle.id(), event = event_type, "Routed");
                Delivery::Delivered
            }
            Err(SendError::Full) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user = user,
                    connection = %handle.id(),
                    event = event_type,
                    "Outbound queue full, dropping event"
                );
                Delivery::Dropped
            }
            Err(SendError::Closed) => {
                self.broken.fetch_add(1, Ordering::Relaxed);
                warn!(
                    user = user,
                    connection = %handle.id(),
                    event = event_type,
                    "Send to broken connection"
                );
                Delivery::Broken(handle)
            }
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Envelopes enqueued on a connection.
    pub delivered: u64,
    /// Envelopes addressed to an offline identity.
    pub offline: u64,
    /// Envelopes dropped because the peer was not keeping up.
    pub dropped: u64,
    /// Sends that found a broken connection.
    pub broken: u64,
}
