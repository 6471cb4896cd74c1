//! Local read-only status endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::diagnostics::{Diagnostics, DiagnosticsSource};
use crate::coordinator::ConversationState;
use crate::shutdown::Shutdown;
use crate::{Error, Result};

type SharedSource = Arc<dyn DiagnosticsSource>;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Compact status for displays and dashboards
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: ConversationState,
    pub audio_level: f32,
    pub wifi_rssi: Option<i32>,
    pub free_memory_kb: Option<u64>,
    pub connected: bool,
    pub uptime_ms: u64,
}

/// Liveness probe
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(source): State<SharedSource>) -> Json<StatusResponse> {
    let d = source.diagnostics();
    Json(StatusResponse {
        state: d.state,
        audio_level: d.telemetry.audio_level,
        wifi_rssi: d.wifi_rssi,
        free_memory_kb: d.free_memory_kb,
        connected: d.coordinator.connected,
        uptime_ms: d.telemetry.uptime_ms,
    })
}

async fn diagnostics(State(source): State<SharedSource>) -> Json<Diagnostics> {
    Json(source.diagnostics())
}

/// Build the status router
pub fn router(source: SharedSource) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/diagnostics", get(diagnostics))
        .with_state(source)
        .layer(TraceLayer::new_for_http())
}

/// Status HTTP server
pub struct StatusServer {
    source: SharedSource,
    port: u16,
}

impl StatusServer {
    #[must_use]
    pub fn new(source: SharedSource, port: u16) -> Self {
        Self { source, port }
    }

    /// Serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind status server: {e}")))?;

        tracing::info!(port = self.port, "status server listening");

        axum::serve(listener, router(self.source))
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .map_err(|e| Error::Config(format!("status server error: {e}")))?;

        Ok(())
    }

    /// Run the status server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: Shutdown) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}
