//! # parley-transport
//!
//! Connection abstraction for the Parley signaling server.
//!
//! - **WebSocket** - axum upgrade adapter (feature `websocket`, on by default)
//! - **Memory** - an in-process connection pair for tests and embedding
//!
//! All transports implement [`Connection`], so the signaling loop never sees
//! frames or sockets, only decoded envelopes.
//!
//! ```rust,ignore
//! use parley_transport::Connection;
//!
//! async fn drain(mut conn: impl Connection) {
//!     while let Ok(Some(event)) = conn.recv().await {
//!         // Process event
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WsConnection;
