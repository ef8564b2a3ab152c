//! Update queue inspection

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use agora_common::update_queue::{get_entry, DirtyEntry};

#[derive(Debug, Serialize)]
pub struct QueueEntryResponse {
    #[serde(flatten)]
    pub entry: DirtyEntry,
    pub pending: bool,
}

/// GET /queue/:conversation_id
pub async fn queue_entry(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> ApiResult<Json<QueueEntryResponse>> {
    let entry = get_entry(&state.db, conversation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("queue entry for conversation {}", conversation_id)))?;

    Ok(Json(QueueEntryResponse {
        pending: entry.is_pending(),
        entry,
    }))
}

pub fn queue_routes() -> Router<AppState> {
    Router::new().route("/queue/:conversation_id", get(queue_entry))
}
