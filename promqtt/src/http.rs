//! HTTP server for the metrics endpoint and introspection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::bridge::SharedController;
use crate::config::{BridgeConfig, HttpConfig};

/// Content type of the text exposition format.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    controller: SharedController,
    config: Arc<BridgeConfig>,
}

/// Create the HTTP router.
fn create_router(controller: SharedController, config: Arc<BridgeConfig>) -> Router {
    let http = config.http.clone();
    let state = AppState { controller, config };

    Router::new()
        .route(&http.metrics_path, get(metrics_handler))
        .route(&http.config_path, get(config_handler))
        .route(&http.snapshot_path, get(snapshot_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.controller.store().render();

    (
        StatusCode::OK,
        [("content-type", EXPOSITION_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// Handler serving the loaded configuration.
async fn config_handler(State(state): State<AppState>) -> Response {
    Json(state.config.as_ref().clone()).into_response()
}

/// Handler serving a snapshot of the metric store.
async fn snapshot_handler(State(state): State<AppState>) -> Response {
    Json(state.controller.store().snapshot()).into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.controller.is_connected() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - not connected to MQTT broker\n",
        )
            .into_response()
    }
}

/// HTTP server.
pub struct HttpServer {
    controller: SharedController,
    config: Arc<BridgeConfig>,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        controller: SharedController,
        config: Arc<BridgeConfig>,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            controller,
            config,
            listen_addr,
        }
    }

    fn http_config(&self) -> &HttpConfig {
        &self.config.http
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let metrics_path = self.http_config().metrics_path.clone();
        let router = create_router(self.controller, self.config);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            path = %metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
