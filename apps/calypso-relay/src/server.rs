use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{RelayConfig, TransportKind};
use crate::gateway::{self, GatewayClient};
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::socket::websocket_handler;
use crate::store::MemoryConnectionStore;
use crate::transport::RegistryTransport;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Arc<RelayConfig>,
    pub gateway: Option<GatewayClient>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        let gateway = match config.transport {
            TransportKind::Gateway => config.gateway_callback_url.clone().map(GatewayClient::new),
            TransportKind::Socket => None,
        };
        Self {
            relay: Arc::new(build_relay(&config)),
            config: Arc::new(config),
            gateway,
            metrics,
        }
    }
}

/// Wires the registry, transport and store into a [`Relay`].
pub fn build_relay(config: &RelayConfig) -> Relay {
    let registry = Arc::new(ConnectionRegistry::new());
    let transport = Arc::new(RegistryTransport::new(Arc::clone(&registry)));
    let store = Arc::new(MemoryConnectionStore::new());
    Relay::new(registry, transport, store, config.broadcast_policy)
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/debug/connections", get(connections_handler))
        .route("/metrics", get(metrics_handler));

    let routes = match state.config.transport {
        TransportKind::Socket => routes
            .route("/", get(websocket_handler))
            .route("/ws", get(websocket_handler)),
        TransportKind::Gateway => routes
            .route("/gateway/connect", post(gateway::on_connect))
            .route("/gateway/disconnect", post(gateway::on_disconnect))
            .route("/gateway/message", post(gateway::on_message)),
    };

    routes
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind, serve until ctrl-c, then sleep out the grace period.
pub async fn serve(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let grace = config.shutdown_grace;
    let state = AppState::new(config, metrics);
    info!(
        listen_addr = %state.config.listen_addr,
        transport = ?state.config.transport,
        broadcast_policy = ?state.config.broadcast_policy,
        "calypso relay listening"
    );

    serve_on(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serve `state` on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn connections_handler(State(state): State<AppState>) -> Response {
    let roster: Vec<String> = state
        .relay
        .registry()
        .list()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    match state.relay.store().list_connections().await {
        Ok(connections) => Json(json!({
            "active": roster.len(),
            "roster": roster,
            "connections": connections,
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to list stored connections");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
