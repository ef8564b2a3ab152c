//! Conversation imports
//!
//! An import arrives as already-parsed rows. [`request_import`] records it as
//! `processing` and buffers it; the flush creates the conversation in one
//! transaction, reconciles its counters and queues it for recomputation.
//! Imports still `processing` past the stale threshold are failed with a
//! timeout and their owners notified.

use crate::buffer::{BufferedEvent, EventBuffer, FlushHandler, ItemOutcome};
use crate::error::{ApiError, ApiResult};
use crate::records::{self, RecordTable};
use agora_common::counters::reconcile_and_persist;
use agora_common::db::{ConversationRef, FailureReason, ImportRecord, RecordStatus, VoteOption};
use agora_common::events::NotificationKind;
use agora_common::notifications::Notifier;
use agora_common::store::{create_conversation, create_opinion, ensure_user};
use agora_common::time::{now, to_millis};
use agora_common::update_queue::mark_dirty;
use agora_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedOpinion {
    pub content: String,
    /// User id of the opinion author
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedVote {
    /// User id of the voter
    pub participant: String,
    /// Index into [`ImportRequest::opinions`]
    pub opinion_index: usize,
    pub option: VoteOption,
}

/// A buffered import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub import_slug_id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub language_code: String,
    #[serde(default)]
    pub opinions: Vec<ImportedOpinion>,
    #[serde(default)]
    pub votes: Vec<ImportedVote>,
    pub requested_at: i64,
}

impl BufferedEvent for ImportRequest {
    fn dedupe_key(&self) -> String {
        self.import_slug_id.clone()
    }

    fn score(&self) -> i64 {
        self.requested_at
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.import_slug_id.is_empty() {
            return Err("import_slug_id must not be empty".to_string());
        }
        if self.title.trim().is_empty() {
            return Err("title must not be empty".to_string());
        }
        if self.opinions.iter().any(|o| o.content.trim().is_empty() || o.author.is_empty()) {
            return Err("every opinion needs content and an author".to_string());
        }
        if let Some(vote) = self.votes.iter().find(|v| v.opinion_index >= self.opinions.len()) {
            return Err(format!(
                "vote references opinion {} but only {} opinions were imported",
                vote.opinion_index,
                self.opinions.len()
            ));
        }
        Ok(())
    }
}

/// Writes an imported conversation into the primary store
///
/// Runs inside the flush transaction: an error rolls back everything the
/// importer wrote.
#[async_trait]
pub trait ConversationImporter: Send + Sync {
    async fn import(
        &self,
        conn: &mut SqliteConnection,
        request: &ImportRequest,
        now: DateTime<Utc>,
    ) -> Result<ConversationRef>;
}

/// Default importer: conversation, opinions, votes and per-opinion tallies
#[derive(Debug, Default)]
pub struct DbImporter;

#[async_trait]
impl ConversationImporter for DbImporter {
    async fn import(
        &self,
        conn: &mut SqliteConnection,
        request: &ImportRequest,
        now: DateTime<Utc>,
    ) -> Result<ConversationRef> {
        let conversation = create_conversation(
            &mut *conn,
            &Uuid::new_v4().simple().to_string(),
            &request.user_id,
            &request.title,
            request.body.as_deref(),
            &request.language_code,
            now,
        )
        .await?;

        let mut opinion_ids = Vec::with_capacity(request.opinions.len());
        for opinion in &request.opinions {
            ensure_user(&mut *conn, &opinion.author, &opinion.author, now).await?;
            let id = create_opinion(
                &mut *conn,
                conversation.id,
                &Uuid::new_v4().simple().to_string(),
                &opinion.author,
                &opinion.content,
                now,
            )
            .await?;
            opinion_ids.push(id);
        }

        let now_ms = to_millis(now);
        for vote in &request.votes {
            let opinion_id = *opinion_ids.get(vote.opinion_index).ok_or_else(|| {
                agora_common::Error::InvalidInput(format!("no imported opinion {}", vote.opinion_index))
            })?;
            ensure_user(&mut *conn, &vote.participant, &vote.participant, now).await?;

            // Repeated rows for the same voter and opinion keep the first
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO votes (author_id, opinion_id, option, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                "#,
            )
            .bind(&vote.participant)
            .bind(opinion_id)
            .bind(vote.option.as_str())
            .bind(now_ms)
            .execute(&mut *conn)
            .await?;

            if inserted.rows_affected() == 1 {
                let column = vote.option.tally_column();
                sqlx::query(&format!("UPDATE opinions SET {column} = {column} + 1 WHERE id = ?"))
                    .bind(opinion_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        Ok(conversation)
    }
}

/// Applies buffered imports
pub struct ImportFlushHandler {
    db: SqlitePool,
    notifier: Notifier,
    importer: Arc<dyn ConversationImporter>,
}

impl ImportFlushHandler {
    pub fn new(db: SqlitePool, notifier: Notifier, importer: Arc<dyn ConversationImporter>) -> Self {
        Self {
            db,
            notifier,
            importer,
        }
    }

    async fn fail(&self, slug_id: &str, reason: FailureReason, message: &str) -> Result<()> {
        if let Some(user_id) =
            records::mark_failed(&self.db, RecordTable::Import, slug_id, reason, message, now()).await?
        {
            self.notifier
                .notify(
                    &user_id,
                    NotificationKind::ImportFailed,
                    json!({ "import_slug_id": slug_id, "failure_reason": reason.as_str(), "error_message": message }),
                )
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl FlushHandler for ImportFlushHandler {
    type Event = ImportRequest;

    fn name(&self) -> &'static str {
        "imports"
    }

    async fn apply_one(&self, request: &ImportRequest) -> Result<ItemOutcome> {
        let now = now();
        let mut tx = self.db.begin().await?;

        match records::status_of(&mut *tx, RecordTable::Import, &request.import_slug_id).await? {
            None => {
                return Ok(ItemOutcome::Failed(format!(
                    "import record {} not found",
                    request.import_slug_id
                )))
            }
            // Replay of an import already settled
            Some((status, _)) if status != RecordStatus::Processing => return Ok(ItemOutcome::Applied),
            Some(_) => {}
        }

        let conversation = match self.importer.import(&mut *tx, request, now).await {
            Ok(conversation) => conversation,
            Err(e) if e.is_lock_error() => return Err(e),
            Err(e) => {
                drop(tx);
                let message = e.to_string();
                tracing::warn!(
                    import_slug_id = %request.import_slug_id,
                    error = %message,
                    "Import failed"
                );
                self.fail(&request.import_slug_id, FailureReason::ProcessingError, &message)
                    .await?;
                return Ok(ItemOutcome::Failed(message));
            }
        };

        sqlx::query(
            r#"
            UPDATE conversation_import
            SET status = 'completed', conversation_id = ?2, updated_at = ?3
            WHERE slug_id = ?1 AND status = 'processing'
            "#,
        )
        .bind(&request.import_slug_id)
        .bind(conversation.id)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;
        mark_dirty(&mut *tx, conversation.id, now).await?;
        tx.commit().await?;

        // Counters are also reconciled by the recomputation job
        if let Err(e) = reconcile_and_persist(&self.db, conversation.id, now).await {
            tracing::warn!(conversation_id = conversation.id, error = %e, "Post-import reconcile failed");
        }

        tracing::info!(
            import_slug_id = %request.import_slug_id,
            conversation_id = conversation.id,
            opinions = request.opinions.len(),
            votes = request.votes.len(),
            "Import completed"
        );

        self.notifier
            .notify(
                &request.user_id,
                NotificationKind::ImportCompleted,
                json!({
                    "import_slug_id": request.import_slug_id,
                    "conversation_slug_id": conversation.slug_id,
                }),
            )
            .await;

        Ok(ItemOutcome::Applied)
    }

    async fn on_invalid(&self, raw_payload: &str, reason: &str) -> Result<()> {
        match records::slug_from_raw(raw_payload, "import_slug_id") {
            Some(slug_id) => self.fail(&slug_id, FailureReason::InvalidPayload, reason).await,
            None => Ok(()),
        }
    }

    async fn cleanup_stale(&self, threshold: Duration) -> Result<u64> {
        let failed = records::fail_stale(&self.db, RecordTable::Import, threshold, now()).await?;

        for (slug_id, user_id) in &failed {
            tracing::warn!(import_slug_id = %slug_id, "Stale import marked failed");
            self.notifier
                .notify(
                    user_id,
                    NotificationKind::ImportFailed,
                    json!({ "import_slug_id": slug_id, "failure_reason": FailureReason::Timeout.as_str() }),
                )
                .await;
        }

        Ok(failed.len() as u64)
    }
}

/// Body of `POST /imports`
#[derive(Debug, Clone, Deserialize)]
pub struct NewImport {
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_language")]
    pub language_code: String,
    #[serde(default)]
    pub opinions: Vec<ImportedOpinion>,
    #[serde(default)]
    pub votes: Vec<ImportedVote>,
}

fn default_language() -> String {
    "en".to_string()
}

/// Record an import as `processing` and buffer it
pub async fn request_import(
    db: &SqlitePool,
    buffer: &EventBuffer<ImportFlushHandler>,
    input: NewImport,
) -> ApiResult<ImportRecord> {
    let now = now();
    let request = ImportRequest {
        import_slug_id: Uuid::new_v4().simple().to_string(),
        user_id: input.user_id,
        title: input.title,
        body: input.body,
        language_code: input.language_code,
        opinions: input.opinions,
        votes: input.votes,
        requested_at: to_millis(now),
    };
    request.validate().map_err(ApiError::BadRequest)?;
    require_user(db, &request.user_id).await?;

    let now_ms = to_millis(now);
    sqlx::query(
        r#"
        INSERT INTO conversation_import (slug_id, user_id, status, created_at, updated_at)
        VALUES (?1, ?2, 'processing', ?3, ?3)
        "#,
    )
    .bind(&request.import_slug_id)
    .bind(&request.user_id)
    .bind(now_ms)
    .execute(db)
    .await
    .map_err(agora_common::Error::from)?;

    let slug_id = request.import_slug_id.clone();
    if let Err(e) = buffer.add_event(request).await {
        records::mark_failed(
            db,
            RecordTable::Import,
            &slug_id,
            FailureReason::ProcessingError,
            &e.to_string(),
            now,
        )
        .await?;
        return Err(e.into());
    }

    get_import(db, &slug_id).await
}

/// Current state of an import
pub async fn get_import(db: &SqlitePool, slug_id: &str) -> ApiResult<ImportRecord> {
    let row = sqlx::query("SELECT * FROM conversation_import WHERE slug_id = ?")
        .bind(slug_id)
        .fetch_optional(db)
        .await
        .map_err(agora_common::Error::from)?
        .ok_or_else(|| ApiError::NotFound(format!("import {}", slug_id)))?;

    Ok(ImportRecord::from_row(&row)?)
}

pub(crate) async fn require_user(db: &SqlitePool, user_id: &str) -> ApiResult<()> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ? AND is_deleted = 0")
        .bind(user_id)
        .fetch_optional(db)
        .await
        .map_err(agora_common::Error::from)?;

    found
        .map(|_| ())
        .ok_or_else(|| ApiError::NotFound(format!("user {}", user_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImportRequest {
        ImportRequest {
            import_slug_id: "imp1".to_string(),
            user_id: "alice".to_string(),
            title: "Transit".to_string(),
            body: None,
            language_code: "en".to_string(),
            opinions: vec![ImportedOpinion {
                content: "More buses".to_string(),
                author: "bob".to_string(),
            }],
            votes: vec![ImportedVote {
                participant: "carol".to_string(),
                opinion_index: 0,
                option: VoteOption::Agree,
            }],
            requested_at: 1,
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(request().validate().is_ok());
        assert_eq!(request().dedupe_key(), "imp1");
    }

    #[test]
    fn test_vote_out_of_range_is_rejected() {
        let mut bad = request();
        bad.votes[0].opinion_index = 3;
        assert!(bad.validate().unwrap_err().contains("opinion 3"));
    }

    #[test]
    fn test_blank_title_is_rejected() {
        let mut bad = request();
        bad.title = "  ".to_string();
        assert!(bad.validate().is_err());
    }
}
