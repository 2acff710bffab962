use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tradelink_core::MagicKey;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Magic keys
        .route("/keys/{magic_key}/status", get(key_status))
        // Sessions
        .route("/logout", post(logout))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.connection_count().await,
        "sessions": state.hub.session_count().await,
    }))
}

// ---------------------------------------------------------------------------
// Magic keys
// ---------------------------------------------------------------------------

async fn key_status(
    State(state): State<Arc<AppState>>,
    Path(magic_key): Path<String>,
) -> impl IntoResponse {
    match state.hub.key_status(&MagicKey::new(magic_key)).await {
        Some(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "No connections for magic key"})),
        ),
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LogoutRequest {
    token: String,
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LogoutRequest>,
) -> impl IntoResponse {
    match state.hub.logout(&req.token).await {
        Ok(closed) => (StatusCode::OK, Json(serde_json::json!({"closed": closed}))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
