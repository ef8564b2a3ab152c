//! Backing stores for event buffers
//!
//! One interface for both deployments: [`MemoryBufferStore`] for a single
//! instance, [`super::sql_store::SqlBufferStore`] when several API instances
//! share pending events. Entries are keyed by the event's dedupe key and
//! ordered by score; a newer score replaces an older one, never the reverse.
//!
//! Draining *claims* entries rather than removing them. A claimed entry is
//! invisible to other drains until it is acknowledged with
//! [`BufferStore::mark_processed`] / [`BufferStore::mark_failed`] or handed
//! back with [`BufferStore::release`]. Acknowledgement is conditional on the
//! score: if a newer event replaced the entry mid-flush, the newer event
//! stays pending.

use agora_common::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A serialized event as held by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub score: i64,
    pub payload: String,
}

/// An entry that failed conversion or validation during a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub key: String,
    pub score: i64,
    pub payload: String,
    pub error_message: String,
}

#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Insert or replace by key. Returns `false` when an entry with an equal
    /// or newer score is already held (the event is dropped).
    async fn enqueue(&self, entry: StoredEntry) -> Result<bool>;

    /// Claim up to `max` pending entries, oldest score first
    async fn drain_batch(&self, max: usize) -> Result<Vec<StoredEntry>>;

    /// Remove claimed entries whose score is unchanged; returns how many were removed
    async fn mark_processed(&self, entries: &[StoredEntry]) -> Result<usize>;

    /// Park a claimed entry as failed with a message (if its score is unchanged)
    async fn mark_failed(&self, entry: &StoredEntry, error_message: &str) -> Result<()>;

    /// Return claimed entries to the pending set untouched
    async fn release(&self, entries: &[StoredEntry]) -> Result<()>;

    /// Pending entries, claimed or not
    async fn pending_len(&self) -> Result<usize>;

    /// Entries parked by [`BufferStore::mark_failed`]
    async fn failed(&self) -> Result<Vec<FailedEntry>>;
}

#[derive(Debug)]
struct Slot {
    entry: StoredEntry,
    claimed: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    pending: HashMap<String, Slot>,
    failed: HashMap<String, FailedEntry>,
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryBufferStore {
    state: Mutex<MemoryState>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn enqueue(&self, entry: StoredEntry) -> Result<bool> {
        let mut state = self.state.lock().await;

        match state.pending.get_mut(&entry.key) {
            Some(slot) if slot.entry.score >= entry.score => Ok(false),
            Some(slot) => {
                // Keep the claim: the in-flight flush acknowledges by score,
                // so the newer payload survives it and is drained next cycle
                slot.entry = entry;
                Ok(true)
            }
            None => {
                state.failed.remove(&entry.key);
                state.pending.insert(
                    entry.key.clone(),
                    Slot {
                        entry,
                        claimed: false,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn drain_batch(&self, max: usize) -> Result<Vec<StoredEntry>> {
        let mut state = self.state.lock().await;

        let mut available: Vec<&mut Slot> =
            state.pending.values_mut().filter(|slot| !slot.claimed).collect();
        available.sort_by_key(|slot| slot.entry.score);

        Ok(available
            .into_iter()
            .take(max)
            .map(|slot| {
                slot.claimed = true;
                slot.entry.clone()
            })
            .collect())
    }

    async fn mark_processed(&self, entries: &[StoredEntry]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut removed = 0;

        for entry in entries {
            let unchanged = match state.pending.get_mut(&entry.key) {
                Some(slot) if slot.entry.score == entry.score => true,
                Some(slot) => {
                    slot.claimed = false;
                    false
                }
                None => false,
            };
            if unchanged {
                state.pending.remove(&entry.key);
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn mark_failed(&self, entry: &StoredEntry, error_message: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let unchanged = match state.pending.get_mut(&entry.key) {
            Some(slot) if slot.entry.score == entry.score => true,
            Some(slot) => {
                slot.claimed = false;
                false
            }
            None => false,
        };

        if unchanged {
            state.pending.remove(&entry.key);
            state.failed.insert(
                entry.key.clone(),
                FailedEntry {
                    key: entry.key.clone(),
                    score: entry.score,
                    payload: entry.payload.clone(),
                    error_message: error_message.to_string(),
                },
            );
        }

        Ok(())
    }

    async fn release(&self, entries: &[StoredEntry]) -> Result<()> {
        let mut state = self.state.lock().await;
        for entry in entries {
            if let Some(slot) = state.pending.get_mut(&entry.key) {
                slot.claimed = false;
            }
        }
        Ok(())
    }

    async fn pending_len(&self) -> Result<usize> {
        Ok(self.state.lock().await.pending.len())
    }

    async fn failed(&self) -> Result<Vec<FailedEntry>> {
        let state = self.state.lock().await;
        let mut failed: Vec<FailedEntry> = state.failed.values().cloned().collect();
        failed.sort_by_key(|f| f.score);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, score: i64) -> StoredEntry {
        StoredEntry {
            key: key.to_string(),
            score,
            payload: format!("{{\"score\":{}}}", score),
        }
    }

    #[tokio::test]
    async fn test_newer_score_wins_older_is_dropped() {
        let store = MemoryBufferStore::new();

        assert!(store.enqueue(entry("u1:7", 100)).await.unwrap());
        assert!(store.enqueue(entry("u1:7", 200)).await.unwrap());
        assert!(!store.enqueue(entry("u1:7", 150)).await.unwrap());

        let drained = store.drain_batch(10).await.unwrap();
        assert_eq!(drained, vec![entry("u1:7", 200)]);
    }

    #[tokio::test]
    async fn test_drain_claims_oldest_first_and_hides_claimed() {
        let store = MemoryBufferStore::new();
        store.enqueue(entry("c", 3)).await.unwrap();
        store.enqueue(entry("a", 1)).await.unwrap();
        store.enqueue(entry("b", 2)).await.unwrap();

        let first = store.drain_batch(2).await.unwrap();
        assert_eq!(first.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let second = store.drain_batch(10).await.unwrap();
        assert_eq!(second, vec![entry("c", 3)]);
        assert!(store.drain_batch(10).await.unwrap().is_empty());
        assert_eq!(store.pending_len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_mark_processed_keeps_entry_replaced_mid_flush() {
        let store = MemoryBufferStore::new();
        store.enqueue(entry("k", 1)).await.unwrap();
        let drained = store.drain_batch(10).await.unwrap();

        // Newer event for the same key arrives while the flush is running
        store.enqueue(entry("k", 2)).await.unwrap();

        assert_eq!(store.mark_processed(&drained).await.unwrap(), 0);
        assert_eq!(store.drain_batch(10).await.unwrap(), vec![entry("k", 2)]);
    }

    #[tokio::test]
    async fn test_mark_failed_parks_entry_with_message() {
        let store = MemoryBufferStore::new();
        store.enqueue(entry("bad", 1)).await.unwrap();
        let drained = store.drain_batch(10).await.unwrap();

        store.mark_failed(&drained[0], "malformed").await.unwrap();

        assert_eq!(store.pending_len().await.unwrap(), 0);
        let failed = store.failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message, "malformed");
    }

    #[tokio::test]
    async fn test_release_makes_entries_drainable_again() {
        let store = MemoryBufferStore::new();
        store.enqueue(entry("k", 1)).await.unwrap();
        let drained = store.drain_batch(10).await.unwrap();
        store.release(&drained).await.unwrap();

        assert_eq!(store.drain_batch(10).await.unwrap(), drained);
    }
}
