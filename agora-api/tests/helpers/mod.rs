//! Shared fixtures for agora-api integration tests

#![allow(dead_code)]

use agora_api::AppState;
use agora_common::config::{BufferStoreKind, TomlConfig};
use agora_common::db::init_database;
use agora_common::events::EventBus;
use agora_common::store;
use agora_common::time::now;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Fresh database in a temp directory (keep the TempDir alive for the test)
pub async fn setup_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("temp dir");
    let pool = init_database(&temp_dir.path().join("agora.db"))
        .await
        .expect("init database");
    (temp_dir, pool)
}

/// Configuration writing exports under the temp dir
pub fn test_config(temp_dir: &TempDir, store: BufferStoreKind) -> TomlConfig {
    let mut config = TomlConfig::default();
    config.database_path = temp_dir.path().join("agora.db");
    config.exports.output_dir = temp_dir.path().join("exports");
    config.buffer.store = store;
    config
}

/// App state over a fresh database; flush loops are not started
pub async fn setup_state() -> (TempDir, AppState) {
    let (temp_dir, pool) = setup_db().await;
    let config = test_config(&temp_dir, BufferStoreKind::Sqlite);
    let state = AppState::new(pool, EventBus::new(100), &config);
    (temp_dir, state)
}

pub async fn seed_user(pool: &SqlitePool, user_id: &str) {
    let mut conn = pool.acquire().await.unwrap();
    store::ensure_user(&mut conn, user_id, user_id, now()).await.unwrap();
}

pub async fn seed_conversation(pool: &SqlitePool, author_id: &str, slug: &str) -> i64 {
    seed_user(pool, author_id).await;
    let mut conn = pool.acquire().await.unwrap();
    store::create_conversation(&mut conn, slug, author_id, "Title", None, "en", now())
        .await
        .unwrap()
        .id
}

pub async fn seed_opinion(pool: &SqlitePool, conversation_id: i64, author_id: &str, slug: &str) -> i64 {
    seed_user(pool, author_id).await;
    let mut conn = pool.acquire().await.unwrap();
    store::create_opinion(&mut conn, conversation_id, slug, author_id, "content", now())
        .await
        .unwrap()
}

/// `(opinion_count, vote_count, participant_count)` as cached on the conversation
pub async fn cached_counters(pool: &SqlitePool, conversation_id: i64) -> (i64, i64, i64) {
    sqlx::query_as("SELECT opinion_count, vote_count, participant_count FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// `(num_agrees, num_disagrees, num_passes)` of an opinion
pub async fn tallies(pool: &SqlitePool, opinion_id: i64) -> (i64, i64, i64) {
    sqlx::query_as("SELECT num_agrees, num_disagrees, num_passes FROM opinions WHERE id = ?")
        .bind(opinion_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn notification_kinds(pool: &SqlitePool, user_id: &str) -> Vec<String> {
    sqlx::query_scalar("SELECT kind FROM notifications WHERE user_id = ? ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .unwrap()
}
