//! Primary-store access for conversations, opinions and users
//!
//! Only what the pipeline itself needs: the importer creates conversations
//! and opinions, the buffers and the job handler resolve references.

use crate::db::ConversationRef;
use crate::time::to_millis;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection};

/// Insert a user if not present; returns the integer participant id
pub async fn ensure_user(
    conn: &mut SqliteConnection,
    user_id: &str,
    username: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO users (id, username, created_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(username)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

    let participant_id: i64 = sqlx::query_scalar("SELECT participant_id FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(participant_id)
}

/// Create a conversation with zeroed counters
pub async fn create_conversation(
    conn: &mut SqliteConnection,
    slug_id: &str,
    author_id: &str,
    title: &str,
    body: Option<&str>,
    language_code: &str,
    now: DateTime<Utc>,
) -> Result<ConversationRef> {
    let now_ms = to_millis(now);

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO conversations (slug_id, author_id, title, body, language_code, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        RETURNING id
        "#,
    )
    .bind(slug_id)
    .bind(author_id)
    .bind(title)
    .bind(body)
    .bind(language_code)
    .bind(now_ms)
    .fetch_one(&mut *conn)
    .await?;

    Ok(ConversationRef {
        id,
        slug_id: slug_id.to_string(),
    })
}

/// Create an opinion; counters are left to the caller (delta or reconcile)
pub async fn create_opinion(
    conn: &mut SqliteConnection,
    conversation_id: i64,
    slug_id: &str,
    author_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let now_ms = to_millis(now);

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO opinions (slug_id, conversation_id, author_id, content, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        RETURNING id
        "#,
    )
    .bind(slug_id)
    .bind(conversation_id)
    .bind(author_id)
    .bind(content)
    .bind(now_ms)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Look up a live (not deleted) conversation by id
pub async fn conversation_ref<'e, E>(executor: E, conversation_id: i64) -> Result<ConversationRef>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, ConversationRef>(
        "SELECT id, slug_id FROM conversations WHERE id = ? AND is_deleted = 0",
    )
    .bind(conversation_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))
}

/// Language the conversation was written in
pub async fn conversation_language<'e, E>(executor: E, conversation_id: i64) -> Result<String>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>("SELECT language_code FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))
}
