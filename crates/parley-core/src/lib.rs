//! # parley-core
//!
//! Presence and real-time signaling for the Parley server.
//!
//! - **Registry** - The live connection of each user identity
//! - **Router** - Delivers envelopes to online identities
//! - **CallStore** - Call sessions and their ringing/active/ended lifecycle
//! - **Hub** - Call operations, delivery and disconnect cleanup over shared state
//! - **Handler** - The per-connection signaling loop
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Handler   │────▶│     Hub     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                           │        │
//!                                           ▼        ▼
//!                                    ┌──────────┐ ┌───────────┐
//!                                    │  Router  │ │ CallStore │
//!                                    └──────────┘ └───────────┘
//!                                           │
//!                                           ▼
//!                                    ┌──────────┐
//!                                    │ Registry │
//!                                    └──────────┘
//! ```

pub mod call;
pub mod error;
pub mod handler;
pub mod hub;
pub mod registry;
pub mod router;
pub mod store;

pub use call::{CallId, CallSession, CallStatus};
pub use error::CallError;
pub use handler::{serve, CloseReason, ConnectionLoop, HandlerConfig};
pub use hub::{Hub, HubConfig, HubStats};
pub use registry::{ConnectionHandle, Registry, SendError};
pub use router::{Delivery, Router, RouterStats};
pub use store::{CallStore, Transition};
