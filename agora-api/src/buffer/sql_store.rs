//! Shared buffer store on the `buffer_entries` table
//!
//! Lets several API instances feed one set of pending events. Claims are
//! leases (`claimed_until`): an instance that crashes mid-flush loses its
//! claim when the lease runs out and the entries are drained again.

use super::store::{BufferStore, FailedEntry, StoredEntry};
use agora_common::time::{now, to_millis};
use agora_common::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::time::Duration;

/// Default claim lease
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

pub struct SqlBufferStore {
    db: SqlitePool,
    queue: String,
    lease: Duration,
}

impl SqlBufferStore {
    /// `queue` namespaces the entries (one per buffer)
    pub fn new(db: SqlitePool, queue: impl Into<String>) -> Self {
        Self {
            db,
            queue: queue.into(),
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl BufferStore for SqlBufferStore {
    async fn enqueue(&self, entry: StoredEntry) -> Result<bool> {
        let now_ms = to_millis(now());

        // A failed entry with the same key is revived by a newer event
        let result = sqlx::query(
            r#"
            INSERT INTO buffer_entries (queue, entry_key, score, payload, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
            ON CONFLICT(queue, entry_key) DO UPDATE SET
                score = excluded.score,
                payload = excluded.payload,
                status = 'pending',
                error_message = NULL,
                updated_at = excluded.updated_at
            WHERE excluded.score > buffer_entries.score OR buffer_entries.status = 'failed'
            "#,
        )
        .bind(&self.queue)
        .bind(&entry.key)
        .bind(entry.score)
        .bind(&entry.payload)
        .bind(now_ms)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn drain_batch(&self, max: usize) -> Result<Vec<StoredEntry>> {
        let now_ms = to_millis(now());
        let lease_until = now_ms + self.lease.as_millis() as i64;

        // Single statement so two instances can never claim the same entry
        let mut rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            UPDATE buffer_entries
            SET claimed_until = ?3
            WHERE queue = ?1 AND entry_key IN (
                SELECT entry_key FROM buffer_entries
                WHERE queue = ?1
                  AND status = 'pending'
                  AND (claimed_until IS NULL OR claimed_until < ?2)
                ORDER BY score ASC
                LIMIT ?4
            )
            RETURNING entry_key, score, payload
            "#,
        )
        .bind(&self.queue)
        .bind(now_ms)
        .bind(lease_until)
        .bind(max as i64)
        .fetch_all(&self.db)
        .await?;

        rows.sort_by_key(|(_, score, _)| *score);

        Ok(rows
            .into_iter()
            .map(|(key, score, payload)| StoredEntry { key, score, payload })
            .collect())
    }

    async fn mark_processed(&self, entries: &[StoredEntry]) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let mut removed = 0;

        for entry in entries {
            let result = sqlx::query(
                "DELETE FROM buffer_entries WHERE queue = ? AND entry_key = ? AND score = ?",
            )
            .bind(&self.queue)
            .bind(&entry.key)
            .bind(entry.score)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                // Replaced by a newer event mid-flush: drop our claim only
                sqlx::query(
                    "UPDATE buffer_entries SET claimed_until = NULL WHERE queue = ? AND entry_key = ?",
                )
                .bind(&self.queue)
                .bind(&entry.key)
                .execute(&mut *tx)
                .await?;
            } else {
                removed += 1;
            }
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn mark_failed(&self, entry: &StoredEntry, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE buffer_entries
            SET status = CASE WHEN score = ?3 THEN 'failed' ELSE status END,
                error_message = CASE WHEN score = ?3 THEN ?4 ELSE error_message END,
                claimed_until = NULL,
                updated_at = ?5
            WHERE queue = ?1 AND entry_key = ?2
            "#,
        )
        .bind(&self.queue)
        .bind(&entry.key)
        .bind(entry.score)
        .bind(error_message)
        .bind(to_millis(now()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn release(&self, entries: &[StoredEntry]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for entry in entries {
            sqlx::query(
                "UPDATE buffer_entries SET claimed_until = NULL WHERE queue = ? AND entry_key = ?",
            )
            .bind(&self.queue)
            .bind(&entry.key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending_len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM buffer_entries WHERE queue = ? AND status = 'pending'",
        )
        .bind(&self.queue)
        .fetch_one(&self.db)
        .await?;

        Ok(count as usize)
    }

    async fn failed(&self) -> Result<Vec<FailedEntry>> {
        let rows: Vec<(String, i64, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT entry_key, score, payload, error_message
            FROM buffer_entries
            WHERE queue = ? AND status = 'failed'
            ORDER BY score ASC
            "#,
        )
        .bind(&self.queue)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, score, payload, error_message)| FailedEntry {
                key,
                score,
                payload,
                error_message: error_message.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::db::init_database;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlBufferStore, SqlBufferStore) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("agora.db")).await.unwrap();
        (
            temp_dir,
            SqlBufferStore::new(pool.clone(), "votes"),
            SqlBufferStore::new(pool, "votes"),
        )
    }

    fn entry(key: &str, score: i64) -> StoredEntry {
        StoredEntry {
            key: key.to_string(),
            score,
            payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_keeps_newest_score() {
        let (_dir, store, _) = setup().await;

        assert!(store.enqueue(entry("k", 10)).await.unwrap());
        assert!(!store.enqueue(entry("k", 5)).await.unwrap());
        assert!(store.enqueue(entry("k", 20)).await.unwrap());

        let drained = store.drain_batch(10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].score, 20);
    }

    #[tokio::test]
    async fn test_two_instances_never_claim_the_same_entry() {
        let (_dir, a, b) = setup().await;
        for i in 0..5 {
            a.enqueue(entry(&format!("k{}", i), i)).await.unwrap();
        }

        let first = a.drain_batch(3).await.unwrap();
        let second = b.drain_batch(10).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|e| !second.iter().any(|s| s.key == e.key)));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (_dir, a, b) = setup().await;
        let a = a.with_lease(Duration::from_millis(0));
        a.enqueue(entry("k", 1)).await.unwrap();

        assert_eq!(a.drain_batch(10).await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(b.drain_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_ack_and_failure() {
        let (_dir, store, _) = setup().await;
        store.enqueue(entry("ok", 1)).await.unwrap();
        store.enqueue(entry("bad", 2)).await.unwrap();
        store.enqueue(entry("moved", 3)).await.unwrap();

        let drained = store.drain_batch(10).await.unwrap();
        store.enqueue(entry("moved", 4)).await.unwrap();

        let ok_and_moved: Vec<StoredEntry> =
            drained.iter().filter(|e| e.key != "bad").cloned().collect();
        assert_eq!(store.mark_processed(&ok_and_moved).await.unwrap(), 1);
        store.mark_failed(&drained[1], "invalid payload").await.unwrap();

        assert_eq!(store.pending_len().await.unwrap(), 1);
        let failed = store.failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, "bad");
        assert_eq!(failed[0].error_message, "invalid payload");

        let again = store.drain_batch(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].score, 4);
    }
}
