//! Import requests through the import buffer: completion, failure and the
//! stale-processing sweep

mod helpers;

use agora_api::buffer::FlushHandler;
use agora_api::imports::{
    get_import, request_import, ConversationImporter, ImportRequest, ImportedOpinion, ImportedVote,
    NewImport,
};
use agora_api::{ApiError, AppState};
use agora_common::config::BufferStoreKind;
use agora_common::db::{ConversationRef, RecordStatus, VoteOption};
use agora_common::events::EventBus;
use agora_common::time::{now, to_millis};
use agora_common::update_queue;
use agora_common::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helpers::*;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;

fn new_import(user_id: &str) -> NewImport {
    NewImport {
        user_id: user_id.to_string(),
        title: "Bike lanes".to_string(),
        body: Some("Where should they go?".to_string()),
        language_code: "en".to_string(),
        opinions: vec![
            ImportedOpinion {
                content: "Main street".to_string(),
                author: "p1".to_string(),
            },
            ImportedOpinion {
                content: "River path".to_string(),
                author: "p2".to_string(),
            },
        ],
        votes: vec![
            ImportedVote {
                participant: "p1".to_string(),
                opinion_index: 1,
                option: VoteOption::Agree,
            },
            ImportedVote {
                participant: "p3".to_string(),
                opinion_index: 0,
                option: VoteOption::Disagree,
            },
            // Duplicate row, ignored
            ImportedVote {
                participant: "p3".to_string(),
                opinion_index: 0,
                option: VoteOption::Agree,
            },
        ],
    }
}

struct FailingImporter;

#[async_trait]
impl ConversationImporter for FailingImporter {
    async fn import(
        &self,
        _conn: &mut SqliteConnection,
        _request: &ImportRequest,
        _now: DateTime<Utc>,
    ) -> agora_common::Result<ConversationRef> {
        Err(Error::InvalidInput("row 3: unknown column".to_string()))
    }
}

#[tokio::test]
async fn test_import_completes_and_queues_conversation() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;

    let record = request_import(&state.db, &state.imports, new_import("owner")).await.unwrap();
    assert_eq!(record.status, RecordStatus::Processing);
    assert!(record.conversation_id.is_none());

    let report = state.imports.flush().await.unwrap();
    assert_eq!(report.applied, 1);

    let record = get_import(&state.db, &record.slug_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    let conversation_id = record.conversation_id.unwrap();

    // Counters come from reconciliation, not deltas
    assert_eq!(cached_counters(&state.db, conversation_id).await, (2, 2, 2));
    let entry = update_queue::get_entry(&state.db, conversation_id).await.unwrap().unwrap();
    assert!(entry.is_pending());

    assert_eq!(notification_kinds(&state.db, "owner").await, vec!["import_completed"]);
}

#[tokio::test]
async fn test_replayed_import_is_not_applied_twice() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;

    let record = request_import(&state.db, &state.imports, new_import("owner")).await.unwrap();
    state.imports.flush().await.unwrap();

    let replay = ImportRequest {
        import_slug_id: record.slug_id.clone(),
        user_id: "owner".to_string(),
        title: "Bike lanes".to_string(),
        body: None,
        language_code: "en".to_string(),
        opinions: vec![],
        votes: vec![],
        requested_at: to_millis(now()) + 1,
    };
    state.imports.add_event(replay).await.unwrap();
    let report = state.imports.flush().await.unwrap();
    assert_eq!(report.applied, 1);

    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(conversations, 1);
}

#[tokio::test]
async fn test_importer_error_fails_record_and_notifies() {
    let (dir, pool) = setup_db().await;
    let config = test_config(&dir, BufferStoreKind::Memory);
    let state = AppState::with_collaborators(
        pool,
        EventBus::new(16),
        &config,
        Arc::new(FailingImporter),
        Arc::new(agora_api::exports::FileExporter::new(dir.path().join("exports"))),
    );
    seed_user(&state.db, "owner").await;

    let record = request_import(&state.db, &state.imports, new_import("owner")).await.unwrap();
    let report = state.imports.flush().await.unwrap();
    assert_eq!(report.failed, 1);

    let record = get_import(&state.db, &record.slug_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("processing_error"));
    assert!(record.error_message.unwrap().contains("unknown column"));
    assert_eq!(notification_kinds(&state.db, "owner").await, vec!["import_failed"]);
}

#[tokio::test]
async fn test_stale_import_is_failed_with_timeout() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;
    let mut events = state.event_bus.subscribe();

    let record = request_import(&state.db, &state.imports, new_import("owner")).await.unwrap();
    let an_hour_ago = to_millis(now()) - 60 * 60 * 1000;
    sqlx::query("UPDATE conversation_import SET updated_at = ? WHERE slug_id = ?")
        .bind(an_hour_ago)
        .bind(&record.slug_id)
        .execute(&state.db)
        .await
        .unwrap();

    let recovered = state
        .imports
        .handler()
        .cleanup_stale(Duration::from_secs(30 * 60))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let record = get_import(&state.db, &record.slug_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(
        record.error_message.as_deref(),
        Some("Processing timed out after 30 minutes")
    );
    assert_eq!(notification_kinds(&state.db, "owner").await, vec!["import_failed"]);
    assert!(events.try_recv().is_ok());

    // The buffered event finds the record settled and is dropped
    let report = state.imports.flush().await.unwrap();
    assert_eq!(report.applied, 1);
    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(conversations, 0);
}

#[tokio::test]
async fn test_fresh_import_survives_stale_sweep() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;
    request_import(&state.db, &state.imports, new_import("owner")).await.unwrap();

    let recovered = state
        .imports
        .handler()
        .cleanup_stale(Duration::from_secs(30 * 60))
        .await
        .unwrap();
    assert_eq!(recovered, 0);
}

#[tokio::test]
async fn test_sub_minute_stale_threshold_is_reported_in_seconds() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;

    let record = request_import(&state.db, &state.imports, new_import("owner")).await.unwrap();
    sqlx::query("UPDATE conversation_import SET updated_at = ? WHERE slug_id = ?")
        .bind(to_millis(now()) - 60 * 1000)
        .bind(&record.slug_id)
        .execute(&state.db)
        .await
        .unwrap();

    let recovered = state
        .imports
        .handler()
        .cleanup_stale(Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let record = get_import(&state.db, &record.slug_id).await.unwrap();
    assert_eq!(
        record.error_message.as_deref(),
        Some("Processing timed out after 30 seconds")
    );
}

#[tokio::test]
async fn test_import_request_validation() {
    let (_dir, state) = setup_state().await;
    seed_user(&state.db, "owner").await;

    let mut bad = new_import("owner");
    bad.votes[0].opinion_index = 7;
    assert!(matches!(
        request_import(&state.db, &state.imports, bad).await,
        Err(ApiError::BadRequest(_))
    ));

    assert!(matches!(
        request_import(&state.db, &state.imports, new_import("nobody")).await,
        Err(ApiError::NotFound(_))
    ));

    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_import")
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(records, 0);
}
