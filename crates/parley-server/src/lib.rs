//! # parley-server
//!
//! HTTP and WebSocket front end of the Parley signaling hub.
//!
//! - `GET {websocket_path}/:user_id` - signaling connection (`?encoding=json|msgpack`)
//! - `POST /call/initiate`, `/call/respond`, `/call/end`, `GET /call/active`
//! - `POST /chat/send`, `GET /users/:user_id/presence`
//! - `GET /health`, `GET /stats`

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{build_app, run_server, spawn_sweeper, AppState};
