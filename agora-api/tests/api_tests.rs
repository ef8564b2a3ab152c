//! HTTP surface of agora-api, driven through the router with `oneshot`

mod helpers;

use agora_api::build_router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use helpers::*;
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn make_request(
    app: &axum::Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Option<Value>) {
    let request = Request::builder().method(method).uri(path);
    let request = match body {
        Some(json_body) => request
            .header("content-type", "application/json")
            .body(Body::from(json_body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json_body = if bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&bytes).unwrap())
    };

    (status, json_body)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_dir, state) = setup_state().await;
    let app = build_router(state);

    let (status, body) = make_request(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    let body = body.expect("Expected response body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "agora-api");
    assert_eq!(body["pending"]["votes"], 0);
}

#[tokio::test]
async fn test_vote_is_accepted_then_visible_in_queue_after_flush() {
    let (_dir, state) = setup_state().await;
    let conversation = seed_conversation(&state.db, "author", "c1").await;
    let opinion = seed_opinion(&state.db, conversation, "author", "o1").await;
    seed_user(&state.db, "alice").await;
    let app = build_router(state.clone());

    let (status, _) = make_request(
        &app,
        Method::POST,
        "/votes",
        Some(json!({ "user_id": "alice", "opinion_id": opinion, "action": "agree" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let path = format!("/queue/{}", conversation);
    let (status, _) = make_request(&app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    state.votes.flush().await.unwrap();

    let (status, body) = make_request(&app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["pending"], true);
    assert_eq!(body["conversation_id"], conversation);
}

#[tokio::test]
async fn test_invalid_vote_is_rejected_synchronously() {
    let (_dir, state) = setup_state().await;
    let app = build_router(state);

    let (status, body) = make_request(
        &app,
        Method::POST,
        "/votes",
        Some(json!({ "user_id": "alice", "opinion_id": 0, "action": "agree" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body.unwrap()["error"]["code"], "INVALID_EVENT");
}

#[tokio::test]
async fn test_votes_rejected_after_shutdown() {
    let (_dir, state) = setup_state().await;
    state.shutdown_buffers().await;
    let app = build_router(state);

    let (status, body) = make_request(
        &app,
        Method::POST,
        "/votes",
        Some(json!({ "user_id": "alice", "opinion_id": 1, "action": "pass" })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body.unwrap()["error"]["code"], "SHUTTING_DOWN");
}

#[tokio::test]
async fn test_import_lifecycle_over_http() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;
    let app = build_router(state.clone());

    let (status, body) = make_request(
        &app,
        Method::POST,
        "/imports",
        Some(json!({
            "user_id": "owner",
            "title": "Parks",
            "opinions": [{ "content": "More trees", "author": "p1" }],
            "votes": [{ "participant": "p2", "opinion_index": 0, "option": "agree" }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let slug = body.unwrap()["slug_id"].as_str().unwrap().to_string();

    state.imports.flush().await.unwrap();

    let (status, body) = make_request(&app, Method::GET, &format!("/imports/{}", slug), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["status"], "completed");
}

#[tokio::test]
async fn test_unknown_import_is_404() {
    let (_dir, state) = setup_state().await;
    let app = build_router(state);

    let (status, body) = make_request(&app, Method::GET, "/imports/missing", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body.unwrap()["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_export_rejections_map_to_status_codes() {
    let (_dir, state) = setup_state().await;
    let empty = seed_conversation(&state.db, "owner", "empty").await;
    let app = build_router(state);

    let (status, body) = make_request(
        &app,
        Method::POST,
        "/exports",
        Some(json!({ "conversation_id": empty, "user_id": "owner" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body.unwrap()["error"]["code"], "NO_OPINIONS");

    let (status, _) = make_request(
        &app,
        Method::POST,
        "/exports",
        Some(json!({ "conversation_id": 999, "user_id": "owner" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
