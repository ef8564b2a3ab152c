//! Import requests and status

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::error::ApiResult;
use crate::imports::{get_import, request_import, NewImport};
use crate::AppState;
use agora_common::db::ImportRecord;

/// POST /imports
pub async fn create_import(
    State(state): State<AppState>,
    Json(body): Json<NewImport>,
) -> ApiResult<(StatusCode, Json<ImportRecord>)> {
    let record = request_import(&state.db, &state.imports, body).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// GET /imports/:slug_id
pub async fn import_status(
    State(state): State<AppState>,
    Path(slug_id): Path<String>,
) -> ApiResult<Json<ImportRecord>> {
    Ok(Json(get_import(&state.db, &slug_id).await?))
}

pub fn import_routes() -> Router<AppState> {
    Router::new()
        .route("/imports", post(create_import))
        .route("/imports/:slug_id", get(import_status))
}
