//! Vote intake

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::votes::{BufferedVote, VotingAction};
use crate::AppState;

/// POST /votes request body
#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub user_id: String,
    pub opinion_id: i64,
    pub action: VotingAction,
    /// Client event time; defaults to receipt time
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

/// POST /votes
///
/// Accepted once buffered; tallies and counters follow on the next flush.
pub async fn cast_vote(
    State(state): State<AppState>,
    Json(body): Json<VoteBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let vote = BufferedVote {
        user_id: body.user_id,
        opinion_id: body.opinion_id,
        action: body.action,
        timestamp_ms: body
            .timestamp_ms
            .unwrap_or_else(|| agora_common::time::to_millis(agora_common::time::now())),
    };

    state.votes.add_event(vote).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

pub fn vote_routes() -> Router<AppState> {
    Router::new().route("/votes", post(cast_vote))
}
