//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use agora_common::time::to_millis;
use agora_common::update_queue;
use chrono::Utc;
use serde::Serialize;

use crate::MathService;

/// Update-queue backlog
#[derive(Debug, Serialize)]
pub struct QueueBacklog {
    pub pending: Option<i64>,
    pub oldest_pending_age_ms: Option<i64>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", "lagging" past the staleness threshold, or "degraded" when the
    /// queue cannot be read
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub queue: QueueBacklog,
}

/// GET /health
pub async fn health_check(State(service): State<MathService>) -> Json<HealthResponse> {
    let now = Utc::now();
    let uptime_seconds = now.signed_duration_since(service.startup_time).num_seconds().max(0) as u64;

    let pending = update_queue::pending_count(&service.db).await.ok();
    let oldest = update_queue::oldest_pending(&service.db).await;
    let degraded = pending.is_none() || oldest.is_err();

    let oldest_pending_age_ms = oldest
        .ok()
        .flatten()
        .map(|(_, requested_at)| (to_millis(now) - to_millis(requested_at)).max(0));
    let lagging = oldest_pending_age_ms.is_some_and(|age| age as u64 > service.pipeline.max_staleness_ms);

    let status = if degraded {
        "degraded"
    } else if lagging {
        "lagging"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "agora-math".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        queue: QueueBacklog {
            pending,
            oldest_pending_age_ms,
        },
    })
}

/// Build health check routes
pub fn health_routes() -> Router<MathService> {
    Router::new().route("/health", get(health_check))
}
