//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Pending events per buffer
#[derive(Debug, Serialize)]
pub struct BufferDepths {
    pub votes: Option<usize>,
    pub imports: Option<usize>,
    pub exports: Option<usize>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when a buffer store cannot be read
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pending: BufferDepths,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let pending = BufferDepths {
        votes: state.votes.pending().await.ok(),
        imports: state.imports.pending().await.ok(),
        exports: state.exports.pending().await.ok(),
    };
    let degraded = pending.votes.is_none() || pending.imports.is_none() || pending.exports.is_none();

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        module: "agora-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        pending,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
