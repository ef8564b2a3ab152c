//! Update queue: one durable "needs recomputation" watermark per conversation
//!
//! The queue is a passive ledger. Writers call [`mark_dirty`]; the scanner
//! decides eligibility with [`find_eligible`]; the recomputation job stamps
//! its start with [`lock_for_processing`] and clears the entry with
//! [`mark_processed`], a compare-and-swap on `requested_at`.
//!
//! Rows are never deleted. A row is pending while `processed_at` is NULL or
//! older than `requested_at`.

use crate::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use crate::time::{from_millis, to_millis};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite, SqlitePool};

/// Snapshot of a queue row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirtyEntry {
    pub conversation_id: i64,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_math_update_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DirtyEntry {
    pub fn is_pending(&self) -> bool {
        match self.processed_at {
            None => true,
            Some(processed) => processed < self.requested_at,
        }
    }
}

/// A conversation the scanner may dispatch right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleConversation {
    pub conversation_id: i64,
    pub conversation_slug_id: String,
    pub requested_at: DateTime<Utc>,
}

/// Record that a conversation has changes newer than its last recomputation
///
/// Upsert: N rapid calls collapse into one pending row. `requested_at` only
/// moves forward (at least one millisecond per call) so a job that captured
/// the previous value can always detect that it went stale, even when two
/// signals land in the same millisecond or instance clocks disagree.
pub async fn mark_dirty<'e, E>(executor: E, conversation_id: i64, now: DateTime<Utc>) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now_ms = to_millis(now);

    sqlx::query(
        r#"
        INSERT INTO conversation_update_queue (conversation_id, requested_at, processed_at, created_at)
        VALUES (?1, ?2, NULL, ?2)
        ON CONFLICT(conversation_id) DO UPDATE SET
            requested_at = MAX(excluded.requested_at, conversation_update_queue.requested_at + 1),
            processed_at = NULL
        "#,
    )
    .bind(conversation_id)
    .bind(now_ms)
    .execute(executor)
    .await?;

    tracing::trace!(conversation_id, requested_at = now_ms, "Conversation marked dirty");

    Ok(())
}

/// Pending conversations outside their rate-limit window
///
/// Eligible when the entry is pending and the conversation was either never
/// recomputed or last started recomputing more than `min_time_between_updates`
/// before `now`. Soft-deleted conversations are never eligible.
pub async fn find_eligible(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    min_time_between_updates: std::time::Duration,
) -> Result<Vec<EligibleConversation>> {
    let cutoff = to_millis(now) - min_time_between_updates.as_millis() as i64;

    let rows: Vec<(i64, String, i64)> = sqlx::query_as(
        r#"
        SELECT q.conversation_id, c.slug_id, q.requested_at
        FROM conversation_update_queue q
        JOIN conversations c ON c.id = q.conversation_id
        WHERE c.is_deleted = 0
          AND (q.processed_at IS NULL OR q.processed_at < q.requested_at)
          AND (q.last_math_update_at IS NULL OR q.last_math_update_at < ?1)
        ORDER BY q.requested_at ASC
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(conversation_id, conversation_slug_id, requested_at)| EligibleConversation {
            conversation_id,
            conversation_slug_id,
            requested_at: from_millis(requested_at),
        })
        .collect())
}

/// Stamp the start of a recomputation, claiming the rate-limit window
///
/// Conditional on the window being open, so a duplicate job dispatched
/// before the first one started cannot run a second computation inside the
/// same window. Returns `false` when the window is already claimed.
pub async fn lock_for_processing(
    pool: &SqlitePool,
    conversation_id: i64,
    now: DateTime<Utc>,
    min_time_between_updates: std::time::Duration,
) -> Result<bool> {
    let now_ms = to_millis(now);
    let cutoff = now_ms - min_time_between_updates.as_millis() as i64;

    let claimed = retry_on_lock("lock queue entry", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
        let result = sqlx::query(
            r#"
            UPDATE conversation_update_queue
            SET last_math_update_at = ?2
            WHERE conversation_id = ?1
              AND (last_math_update_at IS NULL OR last_math_update_at < ?3)
            "#,
        )
        .bind(conversation_id)
        .bind(now_ms)
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok::<_, Error>(result.rows_affected() == 1)
    })
    .await?;

    Ok(claimed)
}

/// Mark the entry processed if `requested_at` still equals `expected_requested_at`
///
/// Single conditional UPDATE; returns `false` (no row updated) when a newer
/// dirty signal arrived after the job captured its watermark.
pub async fn mark_processed(
    pool: &SqlitePool,
    conversation_id: i64,
    expected_requested_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let expected_ms = to_millis(expected_requested_at);
    let now_ms = to_millis(now);

    retry_on_lock("mark queue entry processed", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
        let result = sqlx::query(
            r#"
            UPDATE conversation_update_queue
            SET processed_at = MAX(?3, requested_at)
            WHERE conversation_id = ?1 AND requested_at = ?2
            "#,
        )
        .bind(conversation_id)
        .bind(expected_ms)
        .bind(now_ms)
        .execute(pool)
        .await?;
        Ok::<_, Error>(result.rows_affected() == 1)
    })
    .await
}

/// Current row for a conversation, if it was ever marked dirty
pub async fn get_entry<'e, E>(executor: E, conversation_id: i64) -> Result<Option<DirtyEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64, i64, Option<i64>, Option<i64>, i64)> = sqlx::query_as(
        r#"
        SELECT conversation_id, requested_at, processed_at, last_math_update_at, created_at
        FROM conversation_update_queue
        WHERE conversation_id = ?
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(
        |(conversation_id, requested_at, processed_at, last_math_update_at, created_at)| DirtyEntry {
            conversation_id,
            requested_at: from_millis(requested_at),
            processed_at: processed_at.map(from_millis),
            last_math_update_at: last_math_update_at.map(from_millis),
            created_at: from_millis(created_at),
        },
    ))
}

/// Oldest `requested_at` among pending entries of live conversations
pub async fn oldest_pending(pool: &SqlitePool) -> Result<Option<(i64, DateTime<Utc>)>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT q.conversation_id, q.requested_at
        FROM conversation_update_queue q
        JOIN conversations c ON c.id = q.conversation_id
        WHERE c.is_deleted = 0
          AND (q.processed_at IS NULL OR q.processed_at < q.requested_at)
        ORDER BY q.requested_at ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, requested_at)| (id, from_millis(requested_at))))
}

/// Number of pending entries of live conversations
pub async fn pending_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM conversation_update_queue q
        JOIN conversations c ON c.id = q.conversation_id
        WHERE c.is_deleted = 0
          AND (q.processed_at IS NULL OR q.processed_at < q.requested_at)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(count)
}
