//! Recomputation of one conversation's clusters
//!
//! Steps, in order:
//! 1. claim the rate-limit window (`lock_for_processing`); a closed window
//!    means another job already started this window, and this one is a no-op
//! 2. reconcile the cached counters
//! 3. read the counted votes
//! 4. run the clustering computation
//! 5. translate labels and summaries, then persist the result in one transaction
//! 6. mark the queue entry processed, but only if `requested_at` still
//!    equals the value the scanner saw (compare-and-swap)
//!
//! A lost compare-and-swap is not an error: the entry stays pending and the
//! next scan dispatches it again. A failed attempt whose `requested_at` has
//! already been superseded is not retried either, for the same reason.

use crate::clustering::{ClusterEngine, ClusterRequest, VoteEntry};
use crate::error::MathJobError;
use crate::jobs::Job;
use crate::persistence::persist_math_result;
use crate::translation::{target_languages, translate_cluster_labels, Translator};
use crate::worker::JobHandler;
use agora_common::counters::{counted_votes, reconcile_and_persist};
use agora_common::events::{AgoraEvent, EventBus};
use agora_common::store;
use agora_common::time::{from_millis, now};
use agora_common::update_queue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MATH_JOB: &str = "update-conversation-math";

/// Payload of a recomputation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MathJobPayload {
    pub conversation_id: i64,
    pub conversation_slug_id: String,
    /// Queue watermark observed by the scanner (epoch ms)
    pub requested_at: i64,
}

/// How a recomputation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOutcome {
    /// Result persisted and the queue entry marked processed
    Updated { math_result_id: i64, cluster_count: usize },
    /// Result persisted, but newer changes arrived meanwhile; the entry stays pending
    Stale { math_result_id: i64, cluster_count: usize },
    /// Rate-limit window already claimed by another job
    Skipped,
}

pub struct MathJobHandler {
    db: SqlitePool,
    engine: Arc<dyn ClusterEngine>,
    translator: Option<Arc<dyn Translator>>,
    event_bus: EventBus,
    min_time_between_updates: Duration,
    supported_languages: Vec<String>,
}

impl MathJobHandler {
    pub fn new(
        db: SqlitePool,
        engine: Arc<dyn ClusterEngine>,
        translator: Option<Arc<dyn Translator>>,
        event_bus: EventBus,
        min_time_between_updates: Duration,
        supported_languages: Vec<String>,
    ) -> Self {
        Self {
            db,
            engine,
            translator,
            event_bus,
            min_time_between_updates,
            supported_languages,
        }
    }

    /// Run one recomputation
    pub async fn run(&self, payload: &MathJobPayload) -> Result<MathOutcome, MathJobError> {
        let conversation_id = payload.conversation_id;
        let requested_at = from_millis(payload.requested_at);
        let started = Instant::now();

        let conversation = store::conversation_ref(&self.db, conversation_id).await?;

        if !update_queue::lock_for_processing(&self.db, conversation_id, now(), self.min_time_between_updates).await? {
            tracing::debug!(conversation_id, "Rate-limit window already claimed, skipping");
            return Ok(MathOutcome::Skipped);
        }

        reconcile_and_persist(&self.db, conversation_id, now()).await?;

        let votes: Vec<VoteEntry> = counted_votes(&self.db, conversation_id)
            .await?
            .iter()
            .map(VoteEntry::from)
            .collect();

        let request = ClusterRequest {
            conversation_id,
            conversation_slug_id: conversation.slug_id.clone(),
            votes,
        };
        let result = self.engine.compute(&request).await?;

        let translations = match &self.translator {
            Some(translator) if !result.labels.is_empty() => {
                let source = store::conversation_language(&self.db, conversation_id).await?;
                let targets = target_languages(&self.supported_languages, &source);
                translate_cluster_labels(translator.as_ref(), &result.labels, &source, &targets).await?
            }
            _ => Vec::new(),
        };

        let mut tx = self.db.begin().await?;
        let persisted =
            persist_math_result(&mut *tx, conversation_id, requested_at, &result, &translations, now()).await?;
        tx.commit().await?;

        let processed = update_queue::mark_processed(&self.db, conversation_id, requested_at, now()).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.event_bus.emit_lossy(AgoraEvent::MathUpdated {
            conversation_id,
            math_result_id: persisted.math_result_id,
            cluster_count: persisted.cluster_count,
            timestamp: now(),
        });

        if processed {
            tracing::info!(
                conversation_id,
                slug_id = %conversation.slug_id,
                votes = request.votes.len(),
                clusters = persisted.cluster_count,
                translations = persisted.translation_count,
                elapsed_ms,
                "Conversation math updated"
            );
            Ok(MathOutcome::Updated {
                math_result_id: persisted.math_result_id,
                cluster_count: persisted.cluster_count,
            })
        } else {
            tracing::warn!(
                conversation_id,
                requested_at = payload.requested_at,
                elapsed_ms,
                "Conversation changed during recomputation, left pending for the next scan"
            );
            Ok(MathOutcome::Stale {
                math_result_id: persisted.math_result_id,
                cluster_count: persisted.cluster_count,
            })
        }
    }

    /// True when the queue entry has moved past `requested_at`
    async fn superseded(&self, conversation_id: i64, requested_at: DateTime<Utc>) -> bool {
        match update_queue::get_entry(&self.db, conversation_id).await {
            Ok(Some(entry)) => entry.requested_at > requested_at,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Could not read queue entry after failure");
                false
            }
        }
    }
}

#[async_trait]
impl JobHandler for MathJobHandler {
    fn job_name(&self) -> &'static str {
        MATH_JOB
    }

    async fn handle(&self, job: &Job) -> Result<(), MathJobError> {
        let payload: MathJobPayload = job
            .payload_as()
            .map_err(|e| MathJobError::Malformed(format!("math payload: {}", e)))?;

        match self.run(&payload).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_retryable() => {
                if self.superseded(payload.conversation_id, from_millis(payload.requested_at)).await {
                    tracing::info!(
                        conversation_id = payload.conversation_id,
                        error = %err,
                        "Recomputation failed but newer changes are queued, not retrying"
                    );
                    return Ok(());
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
