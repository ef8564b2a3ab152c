//! Conversation exports
//!
//! [`request_export`] validates the request up front, records it as
//! `processing`, tells the user the export started and buffers it. The flush
//! writes the export file and completes the record. Completed exports expire
//! after the configured number of days: [`expire_completed`] runs on the
//! buffer's stale-cleanup cadence, deletes the file and moves the record to
//! `expired`.

use crate::buffer::{BufferedEvent, EventBuffer, FlushHandler, ItemOutcome};
use crate::error::{ApiError, ApiResult};
use crate::records::{self, RecordTable};
use agora_common::config::ExportConfig;
use agora_common::db::{ConversationRef, ExportRecord, FailureReason, RecordStatus};
use agora_common::events::NotificationKind;
use agora_common::notifications::Notifier;
use agora_common::store::conversation_ref;
use agora_common::time::{from_millis, now, to_millis};
use agora_common::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Why an export request was turned away before buffering
#[derive(Debug, thiserror::Error)]
pub enum ExportRejected {
    #[error("An export of this conversation is already in progress ({slug_id})")]
    AlreadyActive { slug_id: String },

    #[error("Export cooldown active until {ends_at}")]
    CooldownActive { ends_at: DateTime<Utc> },

    #[error("Conversation has no opinions to export")]
    NoOpinions,
}

/// A buffered export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub export_slug_id: String,
    pub conversation_id: i64,
    pub user_id: String,
    pub requested_at: i64,
}

impl BufferedEvent for ExportRequest {
    fn dedupe_key(&self) -> String {
        self.export_slug_id.clone()
    }

    fn score(&self) -> i64 {
        self.requested_at
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.export_slug_id.is_empty() {
            return Err("export_slug_id must not be empty".to_string());
        }
        if self.conversation_id <= 0 {
            return Err(format!("invalid conversation_id {}", self.conversation_id));
        }
        Ok(())
    }
}

/// What an exporter produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutput {
    pub file_path: String,
    pub total_file_size: i64,
    pub total_file_count: i64,
}

#[async_trait]
pub trait ConversationExporter: Send + Sync {
    async fn export(
        &self,
        db: &SqlitePool,
        conversation: &ConversationRef,
        export_slug_id: &str,
    ) -> Result<ExportOutput>;
}

#[derive(Debug, Serialize)]
struct ExportedOpinion {
    slug_id: String,
    author_id: String,
    content: String,
    num_agrees: i64,
    num_disagrees: i64,
    num_passes: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ExportedVote {
    opinion_slug_id: String,
    author_id: String,
    option: String,
}

#[derive(Debug, Serialize)]
struct ExportDocument {
    conversation_slug_id: String,
    title: String,
    body: Option<String>,
    language_code: String,
    exported_at: DateTime<Utc>,
    opinions: Vec<ExportedOpinion>,
    votes: Vec<ExportedVote>,
}

/// Writes one JSON file per export into a directory
#[derive(Debug, Clone)]
pub struct FileExporter {
    output_dir: PathBuf,
}

impl FileExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl ConversationExporter for FileExporter {
    async fn export(
        &self,
        db: &SqlitePool,
        conversation: &ConversationRef,
        export_slug_id: &str,
    ) -> Result<ExportOutput> {
        let (title, body, language_code): (String, Option<String>, String) =
            sqlx::query_as("SELECT title, body, language_code FROM conversations WHERE id = ?")
                .bind(conversation.id)
                .fetch_one(db)
                .await?;

        let opinions = sqlx::query_as::<_, (String, String, String, i64, i64, i64, i64)>(
            r#"
            SELECT o.slug_id, o.author_id, o.content, o.num_agrees, o.num_disagrees, o.num_passes, o.created_at
            FROM opinions o
            WHERE o.conversation_id = ? AND o.is_deleted = 0
              AND NOT EXISTS (SELECT 1 FROM opinion_moderation m WHERE m.opinion_id = o.id)
            ORDER BY o.id
            "#,
        )
        .bind(conversation.id)
        .fetch_all(db)
        .await?
        .into_iter()
        .map(
            |(slug_id, author_id, content, num_agrees, num_disagrees, num_passes, created_at)| {
                ExportedOpinion {
                    slug_id,
                    author_id,
                    content,
                    num_agrees,
                    num_disagrees,
                    num_passes,
                    created_at: from_millis(created_at),
                }
            },
        )
        .collect();

        let votes = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT o.slug_id, v.author_id, v.option
            FROM votes v
            JOIN opinions o ON o.id = v.opinion_id
            WHERE o.conversation_id = ? AND v.option IS NOT NULL AND o.is_deleted = 0
            ORDER BY v.id
            "#,
        )
        .bind(conversation.id)
        .fetch_all(db)
        .await?
        .into_iter()
        .map(|(opinion_slug_id, author_id, option)| ExportedVote {
            opinion_slug_id,
            author_id,
            option,
        })
        .collect();

        let document = ExportDocument {
            conversation_slug_id: conversation.slug_id.clone(),
            title,
            body,
            language_code,
            exported_at: now(),
            opinions,
            votes,
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::Internal(format!("Failed to serialize export: {}", e)))?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(format!("{}.json", export_slug_id));
        tokio::fs::write(&path, &bytes).await?;

        Ok(ExportOutput {
            file_path: path.to_string_lossy().into_owned(),
            total_file_size: bytes.len() as i64,
            total_file_count: 1,
        })
    }
}

/// Applies buffered exports
pub struct ExportFlushHandler {
    db: SqlitePool,
    notifier: Notifier,
    exporter: Arc<dyn ConversationExporter>,
}

impl ExportFlushHandler {
    pub fn new(db: SqlitePool, notifier: Notifier, exporter: Arc<dyn ConversationExporter>) -> Self {
        Self {
            db,
            notifier,
            exporter,
        }
    }

    async fn fail(&self, slug_id: &str, reason: FailureReason, message: &str) -> Result<()> {
        if let Some(user_id) =
            records::mark_failed(&self.db, RecordTable::Export, slug_id, reason, message, now()).await?
        {
            self.notifier
                .notify(
                    &user_id,
                    NotificationKind::ExportFailed,
                    json!({ "export_slug_id": slug_id, "failure_reason": reason.as_str(), "error_message": message }),
                )
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl FlushHandler for ExportFlushHandler {
    type Event = ExportRequest;

    fn name(&self) -> &'static str {
        "exports"
    }

    async fn apply_one(&self, request: &ExportRequest) -> Result<ItemOutcome> {
        let slug_id = request.export_slug_id.as_str();

        match records::status_of(&self.db, RecordTable::Export, slug_id).await? {
            None => return Ok(ItemOutcome::Failed(format!("export record {} not found", slug_id))),
            Some((status, _)) if status != RecordStatus::Processing => return Ok(ItemOutcome::Applied),
            Some(_) => {}
        }

        let output = match conversation_ref(&self.db, request.conversation_id).await {
            Ok(conversation) => self
                .exporter
                .export(&self.db, &conversation, slug_id)
                .await
                .map(|output| (conversation, output)),
            Err(e) => Err(e),
        };

        let (conversation, output) = match output {
            Ok(done) => done,
            Err(e) if e.is_lock_error() => return Err(e),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(export_slug_id = %slug_id, error = %message, "Export failed");
                self.fail(slug_id, FailureReason::ProcessingError, &message).await?;
                return Ok(ItemOutcome::Failed(message));
            }
        };

        let completed = sqlx::query(
            r#"
            UPDATE conversation_export
            SET status = 'completed', file_path = ?2, total_file_size = ?3, total_file_count = ?4, updated_at = ?5
            WHERE slug_id = ?1 AND status = 'processing'
            "#,
        )
        .bind(slug_id)
        .bind(&output.file_path)
        .bind(output.total_file_size)
        .bind(output.total_file_count)
        .bind(to_millis(now()))
        .execute(&self.db)
        .await?;

        // Lost to the stale sweep while the file was being written
        if completed.rows_affected() == 0 {
            return Ok(ItemOutcome::Applied);
        }

        tracing::info!(
            export_slug_id = %slug_id,
            conversation_id = conversation.id,
            size = output.total_file_size,
            "Export completed"
        );

        self.notifier
            .notify(
                &request.user_id,
                NotificationKind::ExportCompleted,
                json!({
                    "export_slug_id": slug_id,
                    "conversation_slug_id": conversation.slug_id,
                    "total_file_size": output.total_file_size,
                }),
            )
            .await;

        Ok(ItemOutcome::Applied)
    }

    async fn on_invalid(&self, raw_payload: &str, reason: &str) -> Result<()> {
        match records::slug_from_raw(raw_payload, "export_slug_id") {
            Some(slug_id) => self.fail(&slug_id, FailureReason::InvalidPayload, reason).await,
            None => Ok(()),
        }
    }

    async fn cleanup_stale(&self, threshold: Duration) -> Result<u64> {
        let failed = records::fail_stale(&self.db, RecordTable::Export, threshold, now()).await?;

        for (slug_id, user_id) in &failed {
            tracing::warn!(export_slug_id = %slug_id, "Stale export marked failed");
            self.notifier
                .notify(
                    user_id,
                    NotificationKind::ExportFailed,
                    json!({ "export_slug_id": slug_id, "failure_reason": FailureReason::Timeout.as_str() }),
                )
                .await;
        }

        if let Err(e) = expire_completed(&self.db, now()).await {
            tracing::error!(error = %e, "Export expiry sweep failed");
        }

        Ok(failed.len() as u64)
    }
}

/// Expire completed exports whose `expires_at` has passed
///
/// Each record is moved to `expired` with its file path cleared before the
/// file is removed, so a record never points at a deleted file. Returns the
/// slug ids expired.
pub async fn expire_completed(db: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<String>> {
    let now_ms = to_millis(now);
    let candidates: Vec<(String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT slug_id, file_path FROM conversation_export
        WHERE status = 'completed' AND expires_at <= ?
        "#,
    )
    .bind(now_ms)
    .fetch_all(db)
    .await?;

    if !candidates.is_empty() {
        tracing::info!(count = candidates.len(), "Found expired exports to clean up");
    }

    let mut expired = Vec::with_capacity(candidates.len());
    for (slug_id, file_path) in candidates {
        let moved = sqlx::query(
            r#"
            UPDATE conversation_export
            SET status = 'expired', file_path = NULL, updated_at = ?2
            WHERE slug_id = ?1 AND status = 'completed'
            "#,
        )
        .bind(&slug_id)
        .bind(now_ms)
        .execute(db)
        .await?
        .rows_affected();
        if moved == 0 {
            continue;
        }

        if let Some(path) = file_path {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(export_slug_id = %slug_id, path = %path, error = %e, "Failed to delete expired export file");
                }
            }
        }
        tracing::info!(export_slug_id = %slug_id, "Expired export cleaned up");
        expired.push(slug_id);
    }

    Ok(expired)
}

/// Body of `POST /exports`
#[derive(Debug, Clone, Deserialize)]
pub struct NewExport {
    pub conversation_id: i64,
    pub user_id: String,
}

/// Validate, record and buffer an export
pub async fn request_export(
    db: &SqlitePool,
    buffer: &EventBuffer<ExportFlushHandler>,
    notifier: &Notifier,
    config: &ExportConfig,
    input: NewExport,
) -> ApiResult<ExportRecord> {
    let now = now();
    let now_ms = to_millis(now);

    let conversation = conversation_ref(db, input.conversation_id).await?;
    crate::imports::require_user(db, &input.user_id).await?;

    let active: Option<String> = sqlx::query_scalar(
        r#"
        SELECT slug_id FROM conversation_export
        WHERE conversation_id = ? AND user_id = ? AND status = 'processing'
        LIMIT 1
        "#,
    )
    .bind(conversation.id)
    .bind(&input.user_id)
    .fetch_optional(db)
    .await
    .map_err(Error::from)?;
    if let Some(slug_id) = active {
        return Err(ExportRejected::AlreadyActive { slug_id }.into());
    }

    // Failed exports do not start a cooldown
    let last_export: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT MAX(created_at) FROM conversation_export
        WHERE conversation_id = ? AND user_id = ? AND status IN ('completed', 'expired')
        "#,
    )
    .bind(conversation.id)
    .bind(&input.user_id)
    .fetch_one(db)
    .await
    .map_err(Error::from)?;
    if let Some(last) = last_export {
        let ends_at = from_millis(last) + chrono::Duration::seconds(config.cooldown_seconds as i64);
        if now < ends_at {
            return Err(ExportRejected::CooldownActive { ends_at }.into());
        }
    }

    let has_opinions: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM opinions o
            WHERE o.conversation_id = ? AND o.is_deleted = 0
              AND NOT EXISTS (SELECT 1 FROM opinion_moderation m WHERE m.opinion_id = o.id)
        )
        "#,
    )
    .bind(conversation.id)
    .fetch_one(db)
    .await
    .map_err(Error::from)?;
    if !has_opinions {
        return Err(ExportRejected::NoOpinions.into());
    }

    let request = ExportRequest {
        export_slug_id: Uuid::new_v4().simple().to_string(),
        conversation_id: conversation.id,
        user_id: input.user_id,
        requested_at: now_ms,
    };
    let expires_at = now + chrono::Duration::days(config.expiry_days);

    sqlx::query(
        r#"
        INSERT INTO conversation_export (slug_id, conversation_id, user_id, status, expires_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'processing', ?4, ?5, ?5)
        "#,
    )
    .bind(&request.export_slug_id)
    .bind(conversation.id)
    .bind(&request.user_id)
    .bind(to_millis(expires_at))
    .bind(now_ms)
    .execute(db)
    .await
    .map_err(Error::from)?;

    notifier
        .notify(
            &request.user_id,
            NotificationKind::ExportStarted,
            json!({
                "export_slug_id": request.export_slug_id,
                "conversation_slug_id": conversation.slug_id,
            }),
        )
        .await;

    let slug_id = request.export_slug_id.clone();
    if let Err(e) = buffer.add_event(request).await {
        records::mark_failed(
            db,
            RecordTable::Export,
            &slug_id,
            FailureReason::ProcessingError,
            &e.to_string(),
            now,
        )
        .await?;
        return Err(e.into());
    }

    get_export(db, &slug_id).await
}

/// Current state of an export
pub async fn get_export(db: &SqlitePool, slug_id: &str) -> ApiResult<ExportRecord> {
    let row = sqlx::query("SELECT * FROM conversation_export WHERE slug_id = ?")
        .bind(slug_id)
        .fetch_optional(db)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| ApiError::NotFound(format!("export {}", slug_id)))?;

    Ok(ExportRecord::from_row(&row)?)
}
