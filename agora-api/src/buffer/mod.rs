//! Event buffers
//!
//! Request handlers hand mutation events to an [`EventBuffer`] and return
//! immediately; a background flush loop writes them to the primary store in
//! batches. Each buffer is parameterized by a [`FlushHandler`] that knows how
//! to apply one kind of event (votes, imports, exports).
//!
//! Flush cycle:
//! 1. Every Nth cycle, run the handler's stale-item recovery
//! 2. Claim up to `max_batch_size` entries (local fallback first, then the store)
//! 3. Decode and validate each entry; a bad entry is marked failed on its own
//! 4. Apply the rest through the handler, `max_concurrency` at a time
//! 5. Acknowledge applied entries, park per-item failures with their message
//!
//! A handler error (transient store failure) aborts the cycle and releases
//! every claim, so the whole batch is retried on the next tick. Delivery is
//! at-least-once; handlers must tolerate re-application.

pub mod sql_store;
pub mod store;

pub use sql_store::SqlBufferStore;
pub use store::{BufferStore, FailedEntry, MemoryBufferStore, StoredEntry};

use agora_common::config::BufferConfig;
use agora_common::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// An event that can sit in a buffer
pub trait BufferedEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Events with the same key collapse; the highest score wins
    fn dedupe_key(&self) -> String;

    /// Ordering within a key (event timestamp in ms)
    fn score(&self) -> i64;

    /// Synchronous payload validation, run on add and again on flush
    fn validate(&self) -> std::result::Result<(), String>;
}

/// Result of applying a single event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Applied,
    Failed(String),
}

/// Applies one kind of buffered event to the primary store
#[async_trait]
pub trait FlushHandler: Send + Sync + 'static {
    type Event: BufferedEvent;

    /// Buffer name used in logs and as the shared-store queue name
    fn name(&self) -> &'static str;

    /// Apply one event. `Err` means the store is unavailable, not that the
    /// event is bad; bad events return `Ok(ItemOutcome::Failed(_))`.
    async fn apply_one(&self, event: &Self::Event) -> Result<ItemOutcome>;

    /// Apply a batch; outcomes are returned in input order
    async fn apply_batch(
        &self,
        events: &[Self::Event],
        max_concurrency: usize,
    ) -> Result<Vec<ItemOutcome>> {
        let futures: Vec<_> = events.iter().map(|event| self.apply_one(event)).collect();
        let results: Vec<Result<ItemOutcome>> = stream::iter(futures)
            .buffered(max_concurrency.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Called for an entry that could not be decoded or failed validation,
    /// with its raw payload, so the handler can fail any tracking record
    async fn on_invalid(&self, _raw_payload: &str, _reason: &str) -> Result<()> {
        Ok(())
    }

    /// Fail items stuck in "processing" for longer than `threshold`;
    /// returns how many were recovered
    async fn cleanup_stale(&self, _threshold: Duration) -> Result<u64> {
        Ok(0)
    }
}

/// Errors returned to callers of [`EventBuffer::add_event`]
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("{0} buffer is shutting down")]
    ShuttingDown(&'static str),

    #[error("Invalid event: {0}")]
    Invalid(String),
}

/// Counts for one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub drained: usize,
    pub applied: usize,
    pub failed: usize,
    pub stale_recovered: u64,
}

/// Where a claimed entry came from
#[derive(Clone, Copy, PartialEq, Eq)]
enum Source {
    Local,
    Shared,
}

struct Claim {
    source: Source,
    entry: StoredEntry,
}

/// A batching buffer in front of a [`FlushHandler`]
pub struct EventBuffer<H: FlushHandler> {
    handler: Arc<H>,
    store: Arc<dyn BufferStore>,
    /// Holds events the shared store refused; always drained first
    local: MemoryBufferStore,
    settings: BufferConfig,
    flush_lock: Mutex<()>,
    flush_count: AtomicU64,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
}

impl<H: FlushHandler> EventBuffer<H> {
    pub fn new(handler: H, store: Arc<dyn BufferStore>, settings: BufferConfig) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            store,
            local: MemoryBufferStore::new(),
            settings,
            flush_lock: Mutex::new(()),
            flush_count: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Single-instance buffer backed by process memory
    pub fn in_memory(handler: H, settings: BufferConfig) -> Arc<Self> {
        Self::new(handler, Arc::new(MemoryBufferStore::new()), settings)
    }

    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Buffer an event
    ///
    /// Only validation fails synchronously. If the shared store cannot take
    /// the event it is held locally and merged into the next flush.
    pub async fn add_event(&self, event: H::Event) -> std::result::Result<(), BufferError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BufferError::ShuttingDown(self.name()));
        }

        event.validate().map_err(BufferError::Invalid)?;

        let entry = StoredEntry {
            key: event.dedupe_key(),
            score: event.score(),
            payload: serde_json::to_string(&event)
                .map_err(|e| BufferError::Invalid(e.to_string()))?,
        };

        if let Err(e) = self.store.enqueue(entry.clone()).await {
            tracing::warn!(
                buffer = self.name(),
                key = %entry.key,
                error = %e,
                "Shared buffer store unavailable, holding event locally"
            );
            // Local store is in-memory and cannot fail
            let _ = self.local.enqueue(entry).await;
        }

        Ok(())
    }

    /// Pending events (local + shared)
    pub async fn pending(&self) -> Result<usize> {
        Ok(self.local.pending_len().await? + self.store.pending_len().await?)
    }

    /// Events parked as failed (local + shared)
    pub async fn failed(&self) -> Result<Vec<FailedEntry>> {
        let mut failed = self.local.failed().await?;
        failed.extend(self.store.failed().await?);
        Ok(failed)
    }

    /// Spawn the periodic flush loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let buffer = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(buffer.settings.flush_interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                buffer = buffer.name(),
                flush_interval_ms = buffer.settings.flush_interval_ms,
                max_batch_size = buffer.settings.max_batch_size,
                max_concurrency = buffer.settings.max_concurrency,
                "Event buffer flush loop started"
            );

            loop {
                tokio::select! {
                    _ = buffer.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush().await {
                            tracing::warn!(
                                buffer = buffer.name(),
                                error = %e,
                                "Flush cycle aborted, batch will be retried next tick"
                            );
                        }
                    }
                }
            }

            tracing::info!(buffer = buffer.name(), "Event buffer flush loop stopped");
        })
    }

    /// Run one flush cycle
    pub async fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;
        let cycle = self.flush_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = FlushReport::default();

        if let Some(threshold_ms) = self.settings.stale_threshold_ms {
            let every = u64::from(self.settings.stale_cleanup_every_n_flushes.max(1));
            if cycle % every == 0 {
                match self.handler.cleanup_stale(Duration::from_millis(threshold_ms)).await {
                    Ok(recovered) => {
                        report.stale_recovered = recovered;
                        if recovered > 0 {
                            tracing::warn!(
                                buffer = self.name(),
                                recovered,
                                threshold_ms,
                                "Marked stale processing items as failed"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(buffer = self.name(), error = %e, "Stale cleanup failed");
                    }
                }
            }
        }

        let claims = self.claim_batch().await?;
        if claims.is_empty() {
            return Ok(report);
        }
        report.drained = claims.len();

        // Decode; entries that cannot become events fail individually
        let mut events = Vec::with_capacity(claims.len());
        let mut event_claims = Vec::with_capacity(claims.len());
        for claim in claims {
            match decode::<H::Event>(&claim.entry.payload) {
                Ok(event) => {
                    events.push(event);
                    event_claims.push(claim);
                }
                Err(reason) => {
                    self.fail_invalid(&claim, &reason).await;
                    report.failed += 1;
                }
            }
        }

        if events.is_empty() {
            return Ok(report);
        }

        let outcomes = match self
            .handler
            .apply_batch(&events, self.settings.max_concurrency)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.release(&event_claims).await;
                return Err(e);
            }
        };

        let mut applied = Vec::new();
        for (claim, outcome) in event_claims.into_iter().zip(outcomes) {
            match outcome {
                ItemOutcome::Applied => applied.push(claim),
                ItemOutcome::Failed(message) => {
                    tracing::warn!(
                        buffer = self.name(),
                        key = %claim.entry.key,
                        error = %message,
                        "Buffered event failed"
                    );
                    self.mark_failed(&claim, &message).await;
                    report.failed += 1;
                }
            }
        }

        report.applied = applied.len();
        self.acknowledge(&applied).await;

        tracing::debug!(
            buffer = self.name(),
            cycle,
            drained = report.drained,
            applied = report.applied,
            failed = report.failed,
            "Flush cycle complete"
        );

        Ok(report)
    }

    /// Stop accepting events, stop the loop and drain everything pending
    pub async fn shutdown(&self) -> Result<FlushReport> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let mut total = FlushReport::default();
        loop {
            let report = self.flush().await?;
            if report.drained == 0 {
                break;
            }
            total.drained += report.drained;
            total.applied += report.applied;
            total.failed += report.failed;
        }

        tracing::info!(
            buffer = self.name(),
            applied = total.applied,
            failed = total.failed,
            "Event buffer drained on shutdown"
        );

        Ok(total)
    }

    /// Claim up to `max_batch_size` entries, local fallback first. When the
    /// same key is claimed from both places only the newer one is applied;
    /// the older is acknowledged alongside it.
    async fn claim_batch(&self) -> Result<Vec<Claim>> {
        let max = self.settings.max_batch_size;
        let local = self.local.drain_batch(max).await?;

        let shared = if local.len() < max {
            match self.store.drain_batch(max - local.len()).await {
                Ok(entries) => entries,
                Err(e) => {
                    let _ = self.local.release(&local).await;
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        let mut by_key: HashMap<String, Claim> = HashMap::new();
        let mut superseded = Vec::new();
        let all = local
            .into_iter()
            .map(|entry| Claim { source: Source::Local, entry })
            .chain(shared.into_iter().map(|entry| Claim { source: Source::Shared, entry }));

        for claim in all {
            match by_key.remove(&claim.entry.key) {
                Some(existing) if existing.entry.score >= claim.entry.score => {
                    superseded.push(claim);
                    by_key.insert(existing.entry.key.clone(), existing);
                }
                Some(existing) => {
                    superseded.push(existing);
                    by_key.insert(claim.entry.key.clone(), claim);
                }
                None => {
                    by_key.insert(claim.entry.key.clone(), claim);
                }
            }
        }

        if !superseded.is_empty() {
            self.acknowledge(&superseded).await;
        }

        let mut claims: Vec<Claim> = by_key.into_values().collect();
        claims.sort_by_key(|c| c.entry.score);
        Ok(claims)
    }

    async fn fail_invalid(&self, claim: &Claim, reason: &str) {
        tracing::warn!(
            buffer = self.name(),
            key = %claim.entry.key,
            reason,
            "Dropping malformed buffered event"
        );
        if let Err(e) = self.handler.on_invalid(&claim.entry.payload, reason).await {
            tracing::error!(
                buffer = self.name(),
                key = %claim.entry.key,
                error = %e,
                "Could not mark record of malformed event as failed"
            );
        }
        self.mark_failed(claim, reason).await;
    }

    async fn mark_failed(&self, claim: &Claim, message: &str) {
        let result = match claim.source {
            Source::Local => self.local.mark_failed(&claim.entry, message).await,
            Source::Shared => self.store.mark_failed(&claim.entry, message).await,
        };
        if let Err(e) = result {
            tracing::error!(buffer = self.name(), key = %claim.entry.key, error = %e, "Failed to park event");
        }
    }

    async fn acknowledge(&self, claims: &[Claim]) {
        let (local, shared) = split_by_source(claims);
        if !local.is_empty() {
            let _ = self.local.mark_processed(&local).await;
        }
        if !shared.is_empty() {
            // Unacknowledged entries are drained again once their claim
            // lapses; handlers are idempotent
            if let Err(e) = self.store.mark_processed(&shared).await {
                tracing::error!(
                    buffer = self.name(),
                    count = shared.len(),
                    error = %e,
                    "Failed to acknowledge flushed events"
                );
            }
        }
    }

    async fn release(&self, claims: &[Claim]) {
        let (local, shared) = split_by_source(claims);
        let _ = self.local.release(&local).await;
        if let Err(e) = self.store.release(&shared).await {
            tracing::error!(buffer = self.name(), error = %e, "Failed to release claimed events");
        }
    }
}

fn split_by_source(claims: &[Claim]) -> (Vec<StoredEntry>, Vec<StoredEntry>) {
    let mut local = Vec::new();
    let mut shared = Vec::new();
    for claim in claims {
        match claim.source {
            Source::Local => local.push(claim.entry.clone()),
            Source::Shared => shared.push(claim.entry.clone()),
        }
    }
    (local, shared)
}

fn decode<E: BufferedEvent>(payload: &str) -> std::result::Result<E, String> {
    let event: E = serde_json::from_str(payload).map_err(|e| format!("malformed payload: {}", e))?;
    event.validate()?;
    Ok(event)
}
