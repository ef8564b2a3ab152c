//! Update queue behavior: idempotent dirty-marking, rate limiting and the
//! compare-and-swap on `requested_at`

mod helpers;

use agora_common::time::from_millis;
use agora_common::update_queue::{
    find_eligible, get_entry, lock_for_processing, mark_dirty, mark_processed, oldest_pending,
    pending_count,
};
use helpers::{seed_conversation, setup_db};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::time::Duration;

const MIN_GAP: Duration = Duration::from_millis(20_000);

#[tokio::test]
async fn test_repeated_mark_dirty_collapses_into_one_row() {
    let (_dir, pool) = setup_db().await;
    let conversation_id = seed_conversation(&pool, "author", "conv-a").await;

    let base = 1_700_000_000_000;
    for offset in [0, 50, 120, 199] {
        mark_dirty(&pool, conversation_id, from_millis(base + offset)).await.unwrap();
    }

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_update_queue")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let entry = get_entry(&pool, conversation_id).await.unwrap().unwrap();
    assert_eq!(entry.requested_at, from_millis(base + 199));
    assert_eq!(entry.processed_at, None);
    assert_eq!(entry.created_at, from_millis(base));
    assert!(entry.is_pending());
}

#[tokio::test]
async fn test_requested_at_never_moves_backwards() {
    let (_dir, pool) = setup_db().await;
    let conversation_id = seed_conversation(&pool, "author", "conv-a").await;

    let t = 1_700_000_000_000;
    mark_dirty(&pool, conversation_id, from_millis(t)).await.unwrap();
    mark_dirty(&pool, conversation_id, from_millis(t)).await.unwrap();
    mark_dirty(&pool, conversation_id, from_millis(t - 500)).await.unwrap();

    let entry = get_entry(&pool, conversation_id).await.unwrap().unwrap();
    assert_eq!(entry.requested_at, from_millis(t + 2));
}

#[tokio::test]
async fn test_mark_dirty_reopens_processed_entry() {
    let (_dir, pool) = setup_db().await;
    let conversation_id = seed_conversation(&pool, "author", "conv-a").await;

    let t1 = from_millis(1_700_000_000_000);
    mark_dirty(&pool, conversation_id, t1).await.unwrap();
    assert!(mark_processed(&pool, conversation_id, t1, from_millis(1_700_000_001_000))
        .await
        .unwrap());
    assert_eq!(pending_count(&pool).await.unwrap(), 0);

    mark_dirty(&pool, conversation_id, from_millis(1_700_000_002_000)).await.unwrap();
    let entry = get_entry(&pool, conversation_id).await.unwrap().unwrap();
    assert!(entry.is_pending());
    assert_eq!(pending_count(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_find_eligible_respects_rate_limit() {
    let (_dir, pool) = setup_db().await;
    let fresh = seed_conversation(&pool, "author", "never-updated").await;
    let recent = seed_conversation(&pool, "author", "recently-updated").await;
    let old = seed_conversation(&pool, "author", "updated-long-ago").await;
    let done = seed_conversation(&pool, "author", "already-processed").await;

    let now_ms = 1_700_000_100_000;
    let now = from_millis(now_ms);

    for id in [fresh, recent, old, done] {
        mark_dirty(&pool, id, from_millis(now_ms - 1000)).await.unwrap();
    }
    assert!(lock_for_processing(&pool, recent, from_millis(now_ms - 5_000), MIN_GAP).await.unwrap());
    assert!(lock_for_processing(&pool, old, from_millis(now_ms - 60_000), MIN_GAP).await.unwrap());
    assert!(mark_processed(&pool, done, from_millis(now_ms - 1000), now).await.unwrap());

    let eligible = find_eligible(&pool, now, MIN_GAP).await.unwrap();
    let ids: Vec<i64> = eligible.iter().map(|e| e.conversation_id).collect();

    assert!(ids.contains(&fresh));
    assert!(ids.contains(&old));
    assert!(!ids.contains(&recent));
    assert!(!ids.contains(&done));

    let fresh_entry = eligible.iter().find(|e| e.conversation_id == fresh).unwrap();
    assert_eq!(fresh_entry.conversation_slug_id, "never-updated");
    assert_eq!(fresh_entry.requested_at, from_millis(now_ms - 1000));
}

#[tokio::test]
async fn test_lock_for_processing_claims_window_once() {
    let (_dir, pool) = setup_db().await;
    let conversation_id = seed_conversation(&pool, "author", "conv-a").await;
    let t = 1_700_000_000_000;
    mark_dirty(&pool, conversation_id, from_millis(t)).await.unwrap();

    assert!(lock_for_processing(&pool, conversation_id, from_millis(t), MIN_GAP).await.unwrap());
    assert!(!lock_for_processing(&pool, conversation_id, from_millis(t + 19_999), MIN_GAP)
        .await
        .unwrap());
    assert!(lock_for_processing(&pool, conversation_id, from_millis(t + 20_001), MIN_GAP)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_mark_processed_fails_when_watermark_moved() {
    let (_dir, pool) = setup_db().await;
    let conversation_id = seed_conversation(&pool, "author", "conv-x").await;

    let t1 = from_millis(1_700_000_000_000);
    let t2 = from_millis(1_700_000_000_500);
    mark_dirty(&pool, conversation_id, t1).await.unwrap();

    // A new vote lands while the job that captured t1 is running
    mark_dirty(&pool, conversation_id, t2).await.unwrap();

    let updated = mark_processed(&pool, conversation_id, t1, from_millis(1_700_000_001_000))
        .await
        .unwrap();
    assert!(!updated);

    let entry = get_entry(&pool, conversation_id).await.unwrap().unwrap();
    assert!(entry.is_pending());
    assert_eq!(entry.requested_at, t2);

    let eligible = find_eligible(&pool, from_millis(1_700_000_002_000), MIN_GAP).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].conversation_id, conversation_id);
}

#[tokio::test]
async fn test_oldest_pending_reports_stalest_entry() {
    let (_dir, pool) = setup_db().await;
    let a = seed_conversation(&pool, "author", "conv-a").await;
    let b = seed_conversation(&pool, "author", "conv-b").await;

    assert_eq!(oldest_pending(&pool).await.unwrap(), None);

    mark_dirty(&pool, b, from_millis(2_000)).await.unwrap();
    mark_dirty(&pool, a, from_millis(1_000)).await.unwrap();

    assert_eq!(oldest_pending(&pool).await.unwrap(), Some((a, from_millis(1_000))));
}

#[tokio::test]
async fn test_deleted_conversation_is_never_eligible() {
    let (_dir, pool) = setup_db().await;
    let id = seed_conversation(&pool, "author", "gone").await;
    mark_dirty(&pool, id, from_millis(1_700_000_000_000)).await.unwrap();
    sqlx::query("UPDATE conversations SET is_deleted = 1 WHERE id = ?")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let eligible = find_eligible(&pool, from_millis(1_700_000_100_000), MIN_GAP).await.unwrap();
    assert!(eligible.is_empty());
    assert_eq!(pending_count(&pool).await.unwrap(), 0);
    assert!(oldest_pending(&pool).await.unwrap().is_none());
}

#[tokio::test]
async fn test_mark_processed_waits_out_a_held_write_lock() {
    let (dir, pool) = setup_db().await;
    let conversation_id = seed_conversation(&pool, "author", "conv-locked").await;
    let requested_at = from_millis(1_700_000_000_000);
    mark_dirty(&pool, conversation_id, requested_at).await.unwrap();

    // No busy_timeout, so the held lock surfaces as "database is locked"
    let impatient = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(dir.path().join("agora.db"))
                .busy_timeout(Duration::ZERO),
        )
        .await
        .unwrap();

    let mut writer = pool.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *writer).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        sqlx::query("COMMIT").execute(&mut *writer).await.unwrap();
    });

    let processed = mark_processed(&impatient, conversation_id, requested_at, from_millis(1_700_000_001_000))
        .await
        .unwrap();
    release.await.unwrap();

    assert!(processed);
    assert!(!get_entry(&pool, conversation_id).await.unwrap().unwrap().is_pending());
}
