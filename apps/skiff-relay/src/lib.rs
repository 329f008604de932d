//! Rendezvous relay: tracks joined devices and forwards their connection-setup
//! signals. File payloads never pass through here.

pub mod config;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod registry;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::handlers::health_check;
use crate::heartbeat::spawn_heartbeat;
use crate::registry::SessionRegistry;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<SessionRegistry>,
}

impl RelayState {
    pub fn new(config: &Config) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.duplicate_policy)),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the relay on an already-bound listener until the server stops.
pub async fn serve(listener: TcpListener, config: &Config) -> Result<()> {
    let state = RelayState::new(config);
    let heartbeat = spawn_heartbeat(state.registry.clone(), config.heartbeat_interval);

    let addr = listener.local_addr().context("listener has no local address")?;
    info!(
        %addr,
        heartbeat_secs = config.heartbeat_interval.as_secs_f64(),
        policy = ?config.duplicate_policy,
        "relay listening"
    );

    let result = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("relay server failed");
    heartbeat.abort();
    result
}
