//! Shared fixtures for agora-common integration tests

#![allow(dead_code)]

use agora_common::db::init_database;
use agora_common::store;
use agora_common::time::{now, to_millis};
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

pub async fn seed_user(pool: &SqlitePool, user_id: &str) -> i64 {
    let mut conn = pool.acquire().await.unwrap();
    store::ensure_user(&mut conn, user_id, user_id, now()).await.unwrap()
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

/// Write a vote row directly (bypassing counters); `None` is a cancelled vote
pub async fn insert_vote(pool: &SqlitePool, author_id: &str, opinion_id: i64, option: Option<&str>) {
    seed_user(pool, author_id).await;
    let ts = to_millis(now());
    sqlx::query(
        r#"
        INSERT INTO votes (author_id, opinion_id, option, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT(author_id, opinion_id) DO UPDATE SET option = excluded.option
        "#,
    )
    .bind(author_id)
    .bind(opinion_id)
    .bind(option)
    .bind(ts)
    .execute(pool)
    .await
    .unwrap();
}
