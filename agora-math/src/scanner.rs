//! Queue scanner
//!
//! A single self-rescheduling job (`scan-conversations`, singleton key
//! `scan-conversations-loop`) wakes every `scan_interval_ms`, finds
//! conversations whose queue entry is pending and whose rate-limit window
//! is open, and dispatches one recomputation job per conversation. The
//! singleton key keeps several service instances from running duplicate
//! loops.
//!
//! The next wake is scheduled after every scan, whether it succeeded or
//! not. A job whose payload lacks the loop settings is dropped without
//! rescheduling: it predates the current payload format and a healthy loop
//! is already running.

use crate::error::MathJobError;
use crate::jobs::{Job, JobQueue, SendOptions};
use crate::math_job::{MathJobPayload, MATH_JOB};
use crate::worker::JobHandler;
use agora_common::config::PipelineConfig;
use agora_common::time::{from_millis, now, to_millis};
use agora_common::update_queue;
use agora_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;

pub const SCAN_JOB: &str = "scan-conversations";
pub const SCAN_LOOP_KEY: &str = "scan-conversations-loop";

/// Payload of a scan job
///
/// Both fields are optional on the wire so that older payloads can be
/// recognised and dropped instead of failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPayload {
    #[serde(default)]
    pub min_time_between_updates_ms: Option<u64>,
    #[serde(default)]
    pub scan_interval_ms: Option<u64>,
}

impl ScanPayload {
    pub fn from_config(pipeline: &PipelineConfig) -> Self {
        Self {
            min_time_between_updates_ms: Some(pipeline.min_time_between_updates_ms),
            scan_interval_ms: Some(pipeline.scan_interval_ms),
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub eligible: usize,
    /// Newly queued jobs; the rest were already queued
    pub dispatched: usize,
    pub failed: usize,
}

pub struct QueueScanner {
    db: SqlitePool,
    queue: JobQueue,
    math_retry_limit: u32,
    math_retry_delay: Duration,
    max_staleness: Duration,
}

impl QueueScanner {
    pub fn new(db: SqlitePool, queue: JobQueue, pipeline: &PipelineConfig) -> Self {
        // A retry inside the rate-limit window would only find the window claimed
        let retry_delay_ms = pipeline.job_retry_delay_ms.max(pipeline.min_time_between_updates_ms);

        Self {
            db,
            queue,
            math_retry_limit: pipeline.job_retry_limit,
            math_retry_delay: Duration::from_millis(retry_delay_ms),
            max_staleness: Duration::from_millis(pipeline.max_staleness_ms),
        }
    }

    /// Queue the first scan unless a loop is already queued or running
    pub async fn ensure_loop(&self, pipeline: &PipelineConfig, now: DateTime<Utc>) -> Result<bool> {
        if self.queue.has_live(SCAN_JOB, SCAN_LOOP_KEY).await? {
            return Ok(false);
        }

        let options = SendOptions {
            singleton_key: Some(SCAN_LOOP_KEY.to_string()),
            ..SendOptions::default()
        };
        let queued = self
            .queue
            .send(SCAN_JOB, &ScanPayload::from_config(pipeline), options, now)
            .await?
            .is_some();

        if queued {
            tracing::info!(
                scan_interval_ms = pipeline.scan_interval_ms,
                min_time_between_updates_ms = pipeline.min_time_between_updates_ms,
                "Scan loop seeded"
            );
        }
        Ok(queued)
    }

    /// Dispatch a recomputation job for every eligible conversation
    ///
    /// A failed dispatch is logged and counted; it does not stop the others.
    pub async fn scan(&self, min_time_between_updates: Duration, now: DateTime<Utc>) -> Result<ScanReport> {
        let eligible = update_queue::find_eligible(&self.db, now, min_time_between_updates).await?;
        let mut report = ScanReport {
            eligible: eligible.len(),
            ..ScanReport::default()
        };

        for conversation in eligible {
            let payload = MathJobPayload {
                conversation_id: conversation.conversation_id,
                conversation_slug_id: conversation.conversation_slug_id.clone(),
                requested_at: to_millis(conversation.requested_at),
            };
            let options = SendOptions {
                singleton_key: Some(math_job_key(conversation.conversation_id)),
                start_after: None,
                retry_limit: self.math_retry_limit,
                retry_delay: self.math_retry_delay,
            };

            match self.queue.send(MATH_JOB, &payload, options, now).await {
                Ok(Some(_)) => report.dispatched += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        conversation_id = conversation.conversation_id,
                        error = %e,
                        "Failed to dispatch recomputation job"
                    );
                }
            }
        }

        if report.eligible > 0 {
            tracing::info!(
                eligible = report.eligible,
                dispatched = report.dispatched,
                failed = report.failed,
                "Scan dispatched recomputation jobs"
            );
        }

        Ok(report)
    }

    /// Warn when the oldest pending entry has waited longer than the threshold
    ///
    /// Returns the age of the oldest pending entry, if any.
    pub async fn check_staleness(&self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        let Some((conversation_id, requested_at)) = update_queue::oldest_pending(&self.db).await? else {
            return Ok(None);
        };

        let age_ms = (to_millis(now) - to_millis(requested_at)).max(0) as u64;
        let age = Duration::from_millis(age_ms);

        if age > self.max_staleness {
            let pending = update_queue::pending_count(&self.db).await?;
            tracing::warn!(
                conversation_id,
                age_ms,
                max_staleness_ms = self.max_staleness.as_millis() as u64,
                pending,
                "Update queue is falling behind"
            );
        }

        Ok(Some(age))
    }

    async fn reschedule(&self, payload: &ScanPayload, scan_interval_ms: u64, now: DateTime<Utc>) -> Result<()> {
        let options = SendOptions {
            singleton_key: Some(SCAN_LOOP_KEY.to_string()),
            start_after: Some(from_millis(to_millis(now) + scan_interval_ms as i64)),
            ..SendOptions::default()
        };
        self.queue.send(SCAN_JOB, payload, options, now).await?;
        Ok(())
    }
}

/// Singleton key of the recomputation job of one conversation
pub fn math_job_key(conversation_id: i64) -> String {
    format!("update-math-{}", conversation_id)
}

#[async_trait]
impl JobHandler for QueueScanner {
    fn job_name(&self) -> &'static str {
        SCAN_JOB
    }

    async fn handle(&self, job: &Job) -> std::result::Result<(), MathJobError> {
        let payload: ScanPayload = job
            .payload_as()
            .map_err(|e| MathJobError::Malformed(format!("scan payload: {}", e)))?;

        let (Some(min_time_between_updates_ms), Some(scan_interval_ms)) =
            (payload.min_time_between_updates_ms, payload.scan_interval_ms)
        else {
            return Err(MathJobError::Malformed(
                "scan payload without loop settings, not rescheduling".to_string(),
            ));
        };

        let scanned_at = now();
        if let Err(e) = self
            .scan(Duration::from_millis(min_time_between_updates_ms), scanned_at)
            .await
        {
            tracing::error!(error = %e, "Conversation scan failed");
        }
        if let Err(e) = self.check_staleness(scanned_at).await {
            tracing::warn!(error = %e, "Staleness check failed");
        }

        // Runs whatever happened above
        if let Err(e) = self.reschedule(&payload, scan_interval_ms, now()).await {
            tracing::error!(error = %e, "Failed to reschedule conversation scan");
        }

        Ok(())
    }
}
