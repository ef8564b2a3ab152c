//! Export requests and status

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::error::ApiResult;
use crate::exports::{get_export, request_export, NewExport};
use crate::AppState;
use agora_common::db::ExportRecord;

/// POST /exports
pub async fn create_export(
    State(state): State<AppState>,
    Json(body): Json<NewExport>,
) -> ApiResult<(StatusCode, Json<ExportRecord>)> {
    let record = request_export(
        &state.db,
        &state.exports,
        &state.notifier,
        &state.export_config,
        body,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// GET /exports/:slug_id
pub async fn export_status(
    State(state): State<AppState>,
    Path(slug_id): Path<String>,
) -> ApiResult<Json<ExportRecord>> {
    Ok(Json(get_export(&state.db, &slug_id).await?))
}

pub fn export_routes() -> Router<AppState> {
    Router::new()
        .route("/exports", post(create_export))
        .route("/exports/:slug_id", get(export_status))
}
