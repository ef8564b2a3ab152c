//! Database initialization
//!
//! Creates the SQLite file on first run and brings every table up to the
//! current schema. Each table has its own idempotent `create_*` function.
//! All timestamps are INTEGER epoch milliseconds.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas are per-connection, so they go on the connect options rather
    // than a one-off query against whichever connection the pool hands out.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    // Both services and every buffer flush share this pool
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_tables(&pool).await?;

    Ok(pool)
}

/// Create every table and index (idempotent - safe to call multiple times)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_users_table(pool).await?;
    create_conversations_table(pool).await?;
    create_opinions_table(pool).await?;
    create_opinion_moderation_table(pool).await?;
    create_votes_table(pool).await?;

    create_update_queue_table(pool).await?;

    create_import_table(pool).await?;
    create_export_table(pool).await?;
    create_notifications_table(pool).await?;

    create_math_results_table(pool).await?;
    create_clusters_table(pool).await?;
    create_cluster_users_table(pool).await?;
    create_cluster_translation_table(pool).await?;

    create_jobs_table(pool).await?;
    create_buffer_entries_table(pool).await?;

    Ok(())
}

async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    // participant_id is the integer identity handed to the clustering service
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            participant_id INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            username TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_conversations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug_id TEXT NOT NULL UNIQUE,
            author_id TEXT NOT NULL REFERENCES users(id),
            title TEXT NOT NULL,
            body TEXT,
            language_code TEXT NOT NULL DEFAULT 'en',
            is_deleted INTEGER NOT NULL DEFAULT 0,
            opinion_count INTEGER NOT NULL DEFAULT 0,
            vote_count INTEGER NOT NULL DEFAULT 0,
            participant_count INTEGER NOT NULL DEFAULT 0,
            last_reacted_at INTEGER,
            current_math_result_id INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_opinions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS opinions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            author_id TEXT NOT NULL REFERENCES users(id),
            content TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            num_agrees INTEGER NOT NULL DEFAULT 0,
            num_disagrees INTEGER NOT NULL DEFAULT 0,
            num_passes INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_opinions_conversation ON opinions(conversation_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_opinion_moderation_table(pool: &SqlitePool) -> Result<()> {
    // A row here means the opinion is moderated out of every count
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS opinion_moderation (
            opinion_id INTEGER PRIMARY KEY REFERENCES opinions(id) ON DELETE CASCADE,
            action TEXT NOT NULL,
            reason TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_votes_table(pool: &SqlitePool) -> Result<()> {
    // option IS NULL means the vote was cancelled (soft delete)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            author_id TEXT NOT NULL REFERENCES users(id),
            opinion_id INTEGER NOT NULL REFERENCES opinions(id) ON DELETE CASCADE,
            option TEXT CHECK (option IN ('agree', 'disagree', 'pass')),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (author_id, opinion_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_votes_opinion ON votes(opinion_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// One row per conversation; never deleted, acts as a permanent watermark
async fn create_update_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_update_queue (
            conversation_id INTEGER PRIMARY KEY REFERENCES conversations(id) ON DELETE CASCADE,
            requested_at INTEGER NOT NULL,
            processed_at INTEGER,
            last_math_update_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_update_queue_pending ON conversation_update_queue(processed_at, last_math_update_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_import_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_import (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL REFERENCES users(id),
            conversation_id INTEGER REFERENCES conversations(id),
            status TEXT NOT NULL CHECK (status IN ('processing', 'completed', 'failed')),
            failure_reason TEXT,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_status ON conversation_import(status, updated_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_export_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_export (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL REFERENCES users(id),
            status TEXT NOT NULL CHECK (status IN ('processing', 'completed', 'failed', 'expired')),
            failure_reason TEXT,
            error_message TEXT,
            file_path TEXT,
            total_file_size INTEGER,
            total_file_count INTEGER,
            expires_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_export_status ON conversation_export(status, updated_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_notifications_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_math_results_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS math_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            requested_at INTEGER NOT NULL,
            raw_data TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_clusters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            math_result_id INTEGER NOT NULL REFERENCES math_results(id) ON DELETE CASCADE,
            cluster_key TEXT NOT NULL,
            num_users INTEGER NOT NULL,
            ai_label TEXT,
            ai_summary TEXT,
            UNIQUE (math_result_id, cluster_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_cluster_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_users (
            cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
            participant_id INTEGER NOT NULL,
            PRIMARY KEY (cluster_id, participant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_cluster_translation_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_translation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
            language_code TEXT NOT NULL,
            ai_label TEXT,
            ai_summary TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (cluster_id, language_code)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable job queue used by the recomputation service
///
/// At most one queued (`created`) job may exist per `(name, singleton_key)`.
async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            payload TEXT NOT NULL,
            singleton_key TEXT,
            state TEXT NOT NULL CHECK (state IN ('created', 'active', 'completed', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            retry_limit INTEGER NOT NULL DEFAULT 0,
            retry_delay_ms INTEGER NOT NULL DEFAULT 0,
            start_after INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            claim_id TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_singleton_queued
        ON jobs(name, singleton_key)
        WHERE state = 'created' AND singleton_key IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_fetch ON jobs(name, state, start_after)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Shared backing store for event buffers in multi-instance deployments
async fn create_buffer_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS buffer_entries (
            queue TEXT NOT NULL,
            entry_key TEXT NOT NULL,
            score INTEGER NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'failed')),
            error_message TEXT,
            claimed_until INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (queue, entry_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_database_creates_file_and_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("agora.db");

        let pool = init_database(&db_path).await.unwrap();
        assert!(db_path.exists());

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();

        for expected in [
            "buffer_entries",
            "cluster_translation",
            "conversation_export",
            "conversation_import",
            "conversation_update_queue",
            "conversations",
            "jobs",
            "votes",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[tokio::test]
    async fn test_init_database_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("agora.db");

        let pool = init_database(&db_path).await.unwrap();
        create_tables(&pool).await.unwrap();
        pool.close().await;

        init_database(&db_path).await.unwrap();
    }
}
