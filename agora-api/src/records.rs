//! Status transitions shared by import and export records
//!
//! Both tables follow `processing -> completed | failed`. Transitions out of
//! `processing` are conditional on the current status, so a replayed flush
//! or a stale sweep racing a late completion moves a record at most once.

use agora_common::db::{FailureReason, RecordStatus};
use agora_common::time::to_millis;
use agora_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use std::time::Duration;

/// Which status-tracked table a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTable {
    Import,
    Export,
}

impl RecordTable {
    fn table(&self) -> &'static str {
        match self {
            RecordTable::Import => "conversation_import",
            RecordTable::Export => "conversation_export",
        }
    }
}

/// Current status and owner of a record, if it exists
pub async fn status_of<'e, E>(
    executor: E,
    table: RecordTable,
    slug_id: &str,
) -> Result<Option<(RecordStatus, String)>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT status, user_id FROM {} WHERE slug_id = ?", table.table());
    let row: Option<(String, String)> = sqlx::query_as(&sql)
        .bind(slug_id)
        .fetch_optional(executor)
        .await?;

    match row {
        Some((status, user_id)) => Ok(Some((RecordStatus::parse(&status)?, user_id))),
        None => Ok(None),
    }
}

/// Move a `processing` record to `failed`; returns the owner when it moved
pub async fn mark_failed(
    db: &SqlitePool,
    table: RecordTable,
    slug_id: &str,
    reason: FailureReason,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'failed', failure_reason = ?2, error_message = ?3, updated_at = ?4
        WHERE slug_id = ?1 AND status = 'processing'
        RETURNING user_id
        "#,
        table.table()
    );

    let user_id: Option<String> = sqlx::query_scalar(&sql)
        .bind(slug_id)
        .bind(reason.as_str())
        .bind(message)
        .bind(to_millis(now))
        .fetch_optional(db)
        .await?;

    Ok(user_id)
}

/// Fail every record still `processing` after `threshold`
///
/// Returns `(slug_id, user_id)` of each record moved.
pub async fn fail_stale(
    db: &SqlitePool,
    table: RecordTable,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>> {
    let now_ms = to_millis(now);
    let cutoff = now_ms - threshold.as_millis() as i64;
    let message = format!("Processing timed out after {}", describe_threshold(threshold));

    let sql = format!(
        r#"
        UPDATE {}
        SET status = 'failed', failure_reason = ?1, error_message = ?2, updated_at = ?3
        WHERE status = 'processing' AND updated_at < ?4
        RETURNING slug_id, user_id
        "#,
        table.table()
    );

    let rows: Vec<(String, String)> = sqlx::query_as(&sql)
        .bind(FailureReason::Timeout.as_str())
        .bind(message)
        .bind(now_ms)
        .bind(cutoff)
        .fetch_all(db)
        .await?;

    Ok(rows)
}

/// Threshold in the largest unit that divides it exactly
fn describe_threshold(threshold: Duration) -> String {
    let ms = threshold.as_millis();
    if ms >= 60_000 && ms % 60_000 == 0 {
        format!("{} minutes", ms / 60_000)
    } else if ms >= 1000 && ms % 1000 == 0 {
        format!("{} seconds", ms / 1000)
    } else {
        format!("{} ms", ms)
    }
}

/// Slug a record id is stored under, pulled out of a payload that failed to decode
pub fn slug_from_raw(raw_payload: &str, field: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(raw_payload)
        .ok()?
        .get(field)?
        .as_str()
        .map(str::to_string)
}
