//! Connection handlers for Parley server.
//!
//! Builds the HTTP router, upgrades WebSocket connections into signaling
//! loops and runs the background sweeper.

use crate::api;
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, MeteredConnection};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parley_core::{serve, HandlerConfig, Hub, HubStats};
use parley_protocol::codec::Encoding;
use parley_protocol::UserId;
use parley_transport::WsConnection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Presence, routing and call sessions.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    handler: HandlerConfig,
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Arc::new(Hub::with_config(config.hub_config())),
            handler: config.handler_config(),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn try_acquire_slot(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        let previous = self.connections.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            self.connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// One unit of the connection limit, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP and WebSocket router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/call/initiate", post(api::initiate_call))
        .route("/call/respond", post(api::respond_call))
        .route("/call/end", post(api::end_call))
        .route("/call/active", get(api::active_calls))
        .route("/call/session/:call_id", get(api::get_call))
        .route("/chat/send", post(api::send_chat))
        .route("/users/:user_id/presence", get(api::presence));

    for path in state.config.websocket_routes() {
        app = app.route(&path, get(ws_handler));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let sweeper = spawn_sweeper(Arc::clone(&state));
    let app = build_app(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}/:user_id",
        addr, config.transport.websocket_path
    );

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;

    sweeper.abort();
    result?;
    Ok(())
}

/// Periodically prune terminal calls and publish hub gauges.
pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.calls.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pruned = state.hub.prune_terminal();
            if pruned > 0 {
                debug!(pruned = pruned, "Swept terminal calls");
            }
            metrics::publish_hub_stats(&state.hub.stats());
        }
    })
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    connections: usize,
    #[serde(flatten)]
    hub: HubStats,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.connection_count(),
        hub: state.hub.stats(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    encoding: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(params): Query<WsParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let user: UserId = user_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid user id: {}", user_id)))?;
    let encoding = match params.encoding.as_deref() {
        Some(value) => value
            .parse::<Encoding>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => state.config.transport.default_encoding,
    };
    let slot = state.try_acquire_slot().ok_or_else(|| {
        warn!(user = user, "Connection limit reached");
        metrics::record_error("connection_limit");
        ApiError::ServiceUnavailable("Connection limit reached".into())
    })?;

    let max_message_size = state.config.limits.max_message_size;
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    // Oversized frames are answered with an error event by the codec
    Ok(ws.on_upgrade(move |socket| async move {
        let _slot = slot;
        let mut conn = WsConnection::new(socket, encoding).with_max_message_size(max_message_size);
        if let Some(addr) = remote_addr {
            conn = conn.with_remote_addr(addr);
        }
        debug!(user = user, encoding = ?encoding, remote = ?remote_addr, "WebSocket connected");

        let reason = serve(
            Arc::clone(&state.hub),
            user,
            MeteredConnection::new(conn),
            state.handler.clone(),
        )
        .await;
        metrics::record_close(reason);
    }))
}
