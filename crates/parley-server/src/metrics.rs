//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::{CloseReason, HubStats};
use parley_protocol::{ClientEvent, ServerEvent};
use parley_transport::{Connection, ConnectionId, TransportError};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_CLOSED: &str = "parley_connections_closed_total";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
    pub const CALLS_TOTAL: &str = "parley_calls_total";
    pub const CALLS_LIVE: &str = "parley_calls_live";
    pub const CALLS_RETAINED: &str = "parley_calls_retained";
    pub const USERS_ONLINE: &str = "parley_users_online";
    pub const DELIVERIES_TOTAL: &str = "parley_deliveries_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::CONNECTIONS_CLOSED, "Closed connections by reason");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events by direction and type");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(names::CALLS_TOTAL, "Call operations by outcome");
    metrics::describe_gauge!(names::CALLS_LIVE, "Ringing or active calls");
    metrics::describe_gauge!(names::CALLS_RETAINED, "Terminal calls awaiting pruning");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with a live connection");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Routed envelopes by outcome");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record why a connection closed.
pub fn record_close(reason: CloseReason) {
    counter!(names::CONNECTIONS_CLOSED, "reason" => reason.as_str()).increment(1);
}

/// Record an event.
pub fn record_event(direction: &'static str, event_type: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction, "type" => event_type).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Record the outcome of a call operation.
pub fn record_call(operation: &'static str, outcome: &'static str) {
    counter!(names::CALLS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
}

/// Publish a hub snapshot.
pub fn publish_hub_stats(stats: &HubStats) {
    gauge!(names::USERS_ONLINE).set(stats.online as f64);
    gauge!(names::CALLS_LIVE).set(stats.live_calls as f64);
    gauge!(names::CALLS_RETAINED).set(stats.retained_calls as f64);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "delivered").absolute(stats.router.delivered);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "offline").absolute(stats.router.offline);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "dropped").absolute(stats.router.dropped);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "broken").absolute(stats.router.broken);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// A connection that counts the events passing through it.
pub struct MeteredConnection<C> {
    inner: C,
    _guard: ConnectionMetricsGuard,
}

impl<C: Connection> MeteredConnection<C> {
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            _guard: ConnectionMetricsGuard::new(),
        }
    }
}

#[async_trait]
impl<C: Connection> Connection for MeteredConnection<C> {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError> {
        let result = self.inner.recv().await;
        match &result {
            Ok(Some(event)) => record_event("inbound", event.event_type()),
            Ok(None) => {}
            Err(TransportError::Protocol(_)) => record_error("protocol"),
            Err(_) => record_error("transport"),
        }
        result
    }

    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        let result = self.inner.send(event).await;
        match &result {
            Ok(()) => record_event("outbound", event.event_type()),
            Err(_) => record_error("send"),
        }
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }
}
