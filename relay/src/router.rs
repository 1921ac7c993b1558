//! Route table for Backhaul Relay
//!
//! `/tunnel` (and anything below it), `/` and `/health` are reserved;
//! everything else is forwarded through the tunnel.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use backhaul_shared::protocol::{max_frame_size, TUNNEL_PATH};
use serde_json::json;

use crate::forward::forward_request;
use crate::session::accept_session;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(TUNNEL_PATH, any(tunnel_handler))
        .route(&format!("{}/*rest", TUNNEL_PATH), any(tunnel_handler))
        .route("/", get(info_handler))
        .route("/health", get(|| async { "ok" }))
        .fallback(forward_request)
        .with_state(state)
}

async fn tunnel_handler(ws: Option<WebSocketUpgrade>, State(state): State<AppState>) -> Response {
    match ws {
        Some(ws) => {
            let limit = max_frame_size(state.config.max_body_size);
            ws.max_frame_size(limit)
                .max_message_size(limit)
                .on_upgrade(move |socket| accept_session(socket, state))
        }
        None => (StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade").into_response(),
    }
}

async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.sessions.current().await;
    Json(json!({
        "service": "backhaul relay",
        "backend": state.config.backend_url,
        "tunnelConnected": session.is_some(),
        "health": "ok",
        "session": session.map(|s| json!({
            "id": s.id(),
            "connectedAt": s.connected_at().to_rfc3339(),
        })),
        "pending": state.pending.len(),
        "stats": state.metrics.snapshot().await,
    }))
}
