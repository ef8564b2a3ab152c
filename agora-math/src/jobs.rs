//! Durable job queue on the shared database
//!
//! Jobs live in the `jobs` table. A singleton key admits at most one queued
//! (`created`) job per `(name, key)` (enforced by a partial unique index),
//! and [`JobQueue::fetch`] never claims a job whose key already has an
//! active sibling, so at most one job per key runs at a time across every
//! worker process sharing the database.
//!
//! Lifecycle: `created -> active -> completed | failed`, with a failed
//! attempt going back to `created` while retries remain.
//!
//! Every claim writes a fresh `claim_id`. Settling a job (complete or fail)
//! matches on it, so a run whose claim was expired and handed to another
//! worker cannot settle the row that worker now owns.

use agora_common::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use agora_common::time::{from_millis, to_millis};
use agora_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobState::Created),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::InvalidInput(format!("Unknown job state: {}", other))),
        }
    }
}

/// Row of `jobs`
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// `Null` when the stored payload is not valid JSON
    pub payload: serde_json::Value,
    pub singleton_key: Option<String>,
    pub state: JobState,
    pub retry_count: u32,
    pub retry_limit: u32,
    pub start_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Token of the current claim; `None` unless the job has been fetched
    pub claim_id: Option<String>,
}

impl Job {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let raw: String = row.try_get("payload")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payload: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            singleton_key: row.try_get("singleton_key")?,
            state: JobState::parse(row.try_get::<&str, _>("state")?)?,
            retry_count: row.try_get::<i64, _>("retry_count")?.max(0) as u32,
            retry_limit: row.try_get::<i64, _>("retry_limit")?.max(0) as u32,
            start_after: from_millis(row.try_get("start_after")?),
            created_at: from_millis(row.try_get("created_at")?),
            last_error: row.try_get("last_error")?,
            claim_id: row.try_get("claim_id")?,
        })
    }

    /// Decode the payload into the handler's type
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }
}

/// Options for [`JobQueue::send`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub singleton_key: Option<String>,
    /// Not claimable before this instant (immediately when `None`)
    pub start_after: Option<DateTime<Utc>>,
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

/// What [`JobQueue::fail`] did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued; `attempt` is the retry number (1-based)
    Retrying { attempt: u32, start_after: DateTime<Utc> },
    /// No retries left, job is `failed`
    Exhausted,
    /// A job with the same singleton key is already queued, so this one is
    /// `failed` instead of requeued
    Superseded,
    /// The claim expired and the job was requeued or claimed again; the row
    /// is left alone
    ClaimLost,
}

const JOB_COLUMNS: &str =
    "id, name, payload, singleton_key, state, retry_count, retry_limit, start_after, created_at, last_error, claim_id";

/// Handle to the `jobs` table
#[derive(Clone)]
pub struct JobQueue {
    db: SqlitePool,
}

impl JobQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Enqueue a job
    ///
    /// Returns the new job id, or `None` when a job with the same name and
    /// singleton key is already queued.
    pub async fn send<P: Serialize>(
        &self,
        name: &str,
        payload: &P,
        options: SendOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(payload)?;
        let start_after = options.start_after.unwrap_or(now);

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, name, payload, singleton_key, state, retry_count, retry_limit, retry_delay_ms, start_after, created_at)
            VALUES (?1, ?2, ?3, ?4, 'created', 0, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(&payload)
        .bind(&options.singleton_key)
        .bind(options.retry_limit as i64)
        .bind(options.retry_delay.as_millis() as i64)
        .bind(to_millis(start_after))
        .bind(to_millis(now))
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                job = name,
                singleton_key = ?options.singleton_key,
                "Job already queued, send ignored"
            );
            return Ok(None);
        }

        tracing::debug!(job = name, job_id = %id, start_after = %start_after, "Job queued");
        Ok(Some(id))
    }

    /// Claim up to `limit` due jobs of one name, moving them to `active`
    ///
    /// Single statement, so two workers polling at once never claim the
    /// same row. Jobs whose singleton key has an active sibling are skipped.
    pub async fn fetch(&self, name: &str, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE jobs SET state = 'active', started_at = ?3, claim_id = ?4
            WHERE id IN (
                SELECT j.id FROM jobs j
                WHERE j.name = ?1 AND j.state = 'created' AND j.start_after <= ?3
                  AND (j.singleton_key IS NULL OR NOT EXISTS (
                      SELECT 1 FROM jobs a
                      WHERE a.name = j.name AND a.singleton_key = j.singleton_key AND a.state = 'active'
                  ))
                ORDER BY j.start_after ASC, j.created_at ASC
                LIMIT ?2
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let db = &self.db;
        let sql = sql.as_str();
        let claim_id = Uuid::new_v4().to_string();
        let claim_id = claim_id.as_str();
        let now_ms = to_millis(now);

        let rows = retry_on_lock("fetch jobs", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
            let rows = sqlx::query(sql)
                .bind(name)
                .bind(limit as i64)
                .bind(now_ms)
                .bind(claim_id)
                .fetch_all(db)
                .await?;
            Ok::<_, Error>(rows)
        })
        .await?;

        let mut jobs = rows.iter().map(Job::from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|job| (job.start_after, job.created_at));
        Ok(jobs)
    }

    /// Mark a claimed job completed
    ///
    /// Returns `false` when the claim was lost; the row is not touched.
    pub async fn complete(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        let db = &self.db;
        let id = job.id.as_str();
        let claim_id = job.claim_id.as_deref();
        let now_ms = to_millis(now);

        let settled = retry_on_lock("complete job", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'completed', completed_at = ?3 WHERE id = ?1 AND state = 'active' AND claim_id IS ?2",
            )
            .bind(id)
            .bind(claim_id)
            .bind(now_ms)
            .execute(db)
            .await?;
            Ok::<_, Error>(result.rows_affected() == 1)
        })
        .await?;

        if !settled {
            tracing::warn!(job = %job.name, job_id = %job.id, "Claim lost before completion, result not recorded");
        }
        Ok(settled)
    }

    /// Record a failed attempt, requeueing it while retries remain
    pub async fn fail(&self, job: &Job, error: &str, now: DateTime<Utc>) -> Result<FailOutcome> {
        let db = &self.db;
        let id = job.id.as_str();
        let claim_id = job.claim_id.as_deref();

        retry_on_lock("fail job", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
            let mut tx = db.begin().await?;

            let row: Option<(i64, i64, i64)> = sqlx::query_as(
                "SELECT retry_count, retry_limit, retry_delay_ms FROM jobs WHERE id = ? AND state = 'active' AND claim_id IS ?",
            )
            .bind(id)
            .bind(claim_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((retry_count, retry_limit, retry_delay_ms)) = row else {
                return Ok(FailOutcome::ClaimLost);
            };

            let outcome = if retry_count < retry_limit {
                let start_after = from_millis(to_millis(now) + retry_delay_ms);

                let requeued = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'created', retry_count = retry_count + 1, start_after = ?2,
                        started_at = NULL, claim_id = NULL, last_error = ?3
                    WHERE id = ?1
                      AND NOT EXISTS (
                          SELECT 1 FROM jobs s
                          WHERE s.name = jobs.name AND s.singleton_key = jobs.singleton_key AND s.state = 'created'
                      )
                    "#,
                )
                .bind(id)
                .bind(to_millis(start_after))
                .bind(error)
                .execute(&mut *tx)
                .await?;

                if requeued.rows_affected() == 1 {
                    FailOutcome::Retrying {
                        attempt: (retry_count + 1) as u32,
                        start_after,
                    }
                } else {
                    FailOutcome::Superseded
                }
            } else {
                FailOutcome::Exhausted
            };

            if outcome == FailOutcome::Exhausted || outcome == FailOutcome::Superseded {
                mark_failed(&mut *tx, id, claim_id, error, now).await?;
            }

            tx.commit().await?;
            Ok::<_, Error>(outcome)
        })
        .await
    }

    /// Fail a claimed job without consulting its retry budget
    ///
    /// Returns `false` when the claim was lost; the row is not touched.
    pub async fn fail_permanently(&self, job: &Job, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let db = &self.db;
        let id = job.id.as_str();
        let claim_id = job.claim_id.as_deref();

        let settled = retry_on_lock("fail job", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
            let mut conn = db.acquire().await?;
            mark_failed(&mut *conn, id, claim_id, error, now).await
        })
        .await?;

        if !settled {
            tracing::warn!(job = %job.name, job_id = %job.id, "Claim lost before failure was recorded");
        }
        Ok(settled)
    }

    /// Requeue jobs that have been `active` longer than `max_active`
    ///
    /// Their worker is presumed dead. Crash recovery does not consume a
    /// retry. Where a sibling with the same singleton key is already queued
    /// the expired job is failed instead.
    pub async fn expire_active(&self, max_active: Duration, now: DateTime<Utc>) -> Result<u64> {
        let now_ms = to_millis(now);
        let cutoff = now_ms - max_active.as_millis() as i64;
        let mut tx = self.db.begin().await?;

        let superseded = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', completed_at = ?2, last_error = 'expired while active'
            WHERE state = 'active' AND started_at < ?1
              AND EXISTS (
                  SELECT 1 FROM jobs s
                  WHERE s.name = jobs.name AND s.singleton_key = jobs.singleton_key AND s.state = 'created'
              )
            "#,
        )
        .bind(cutoff)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'created', started_at = NULL, claim_id = NULL, start_after = ?2,
                last_error = 'expired while active'
            WHERE state = 'active' AND started_at < ?1
            "#,
        )
        .bind(cutoff)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if superseded + requeued > 0 {
            tracing::warn!(requeued, superseded, "Expired jobs stuck in active state");
        }

        Ok(superseded + requeued)
    }

    /// Delete finished jobs older than `retention`
    pub async fn purge(&self, retention: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = to_millis(now) - retention.as_millis() as i64;

        let deleted = sqlx::query("DELETE FROM jobs WHERE state IN ('completed', 'failed') AND completed_at < ?")
            .bind(cutoff)
            .execute(&self.db)
            .await?
            .rows_affected();

        if deleted > 0 {
            tracing::debug!(deleted, "Purged finished jobs");
        }

        Ok(deleted)
    }

    /// True when a job with this name and key is queued or running
    pub async fn has_live(&self, name: &str, singleton_key: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM jobs WHERE name = ? AND singleton_key = ? AND state IN ('created', 'active') LIMIT 1",
        )
        .bind(name)
        .bind(singleton_key)
        .fetch_optional(&self.db)
        .await?;

        Ok(found.is_some())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await?;
        row.as_ref().map(Job::from_row).transpose()
    }

    /// Jobs of one name in one state, oldest first
    pub async fn list(&self, name: &str, state: JobState) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE name = ? AND state = ? ORDER BY created_at ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(name)
            .bind(state.as_str())
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(Job::from_row).collect()
    }
}

async fn mark_failed(
    conn: &mut sqlx::SqliteConnection,
    id: &str,
    claim_id: Option<&str>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'failed', completed_at = ?3, last_error = ?4 WHERE id = ?1 AND state = 'active' AND claim_id IS ?2",
    )
    .bind(id)
    .bind(claim_id)
    .bind(to_millis(now))
    .bind(error)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
