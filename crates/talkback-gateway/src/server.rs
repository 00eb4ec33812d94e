//! Axum HTTP and WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use talkback_core::error::TalkError;
use talkback_core::store::MemoryStore;

use crate::connection::handle_talk_socket;
use crate::routes::{self, ApiError, user_id_from_headers};
use crate::state::GatewayState;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// All gateway routes bound to `state`.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/talk", post(routes::create_talk))
        .route("/talk/{session_id}/turns", post(routes::add_turn))
        .route("/talk/{session_id}/context", get(routes::session_context));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
    .with_state(state)
}

/// Start the gateway and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();

    if let Some(store) = state.memory_store.clone() {
        tokio::spawn(purge_loop(store));
    }

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsParams {
    user_id: Option<String>,
}

/// Upgrade to a streaming talk socket. The user comes from `?user_id=` or the `x-user-id` header.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let user_id = params
        .user_id
        .filter(|u| !u.trim().is_empty())
        .or_else(|| user_id_from_headers(&headers));
    let Some(user_id) = user_id else {
        return ApiError(TalkError::InvalidInput("missing user_id".into())).into_response();
    };
    ws.on_upgrade(move |socket| handle_talk_socket(state, user_id, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connection_count(),
        "streams": state.orchestrator.registry().handle_count(),
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

async fn purge_loop(store: Arc<MemoryStore>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        let purged = store.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Purged expired conversations");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
