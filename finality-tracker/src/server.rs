// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operational HTTP endpoints: Prometheus scrape and liveness.

use crate::store::FinalityStore;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct ServerState {
    registry: Registry,
    store: Arc<dyn FinalityStore>,
}

pub fn router(registry: Registry, store: Arc<dyn FinalityStore>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(ServerState { registry, store })
}

/// Binds `addr` and serves until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    registry: Registry,
    store: Arc<dyn FinalityStore>,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    info!("[Server] Metrics server listening on {}", listener.local_addr()?);
    Ok(serve_on(listener, registry, store, cancel))
}

pub fn serve_on(
    listener: TcpListener,
    registry: Registry,
    store: Arc<dyn FinalityStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let app = router(registry, store);
    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("[Server] Metrics server error: {:?}", e);
        }
    })
}

async fn metrics(State(state): State<ServerState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("[Server] Failed to encode metrics: {:?}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Healthy while the store answers.
async fn healthz(State(state): State<ServerState>) -> Response {
    match state.store.list_chains().await {
        Ok(chains) => Json(serde_json::json!({
            "status": "ok",
            "service": "orbit-finality-tracker",
            "chains": chains.len(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "error": e.to_string(),
            })),
        )
            .into_response(),
    }
}
