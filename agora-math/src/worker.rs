//! Job workers
//!
//! A [`Worker`] polls the job queue for one job name and runs claimed jobs
//! on its [`JobHandler`], at most `concurrency` at a time. Handler results
//! drive the job lifecycle: success completes the job, a retryable error
//! goes back through [`JobQueue::fail`], anything else fails it for good.

use crate::error::MathJobError;
use crate::jobs::{FailOutcome, Job, JobQueue};
use agora_common::time::now;
use agora_common::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Runs jobs of one name
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Queue name this handler consumes
    fn job_name(&self) -> &'static str;

    async fn handle(&self, job: &Job) -> std::result::Result<(), MathJobError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs running at once
    pub concurrency: usize,
    /// Most jobs claimed per poll
    pub batch_size: usize,
    pub poll_interval: Duration,
}

pub struct Worker<H: JobHandler> {
    queue: JobQueue,
    handler: Arc<H>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(queue: JobQueue, handler: Arc<H>, config: WorkerConfig, cancel: CancellationToken) -> Arc<Self> {
        let concurrency = config.concurrency.max(1);
        Arc::new(Self {
            queue,
            handler,
            config: WorkerConfig { concurrency, ..config },
            permits: Arc::new(Semaphore::new(concurrency)),
            cancel,
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Spawn the polling loop
    ///
    /// On cancellation the loop stops claiming and waits for running jobs.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(worker.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                job = worker.handler.job_name(),
                concurrency = worker.config.concurrency,
                batch_size = worker.config.batch_size,
                "Job worker started"
            );

            loop {
                tokio::select! {
                    _ = worker.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = worker.poll().await {
                            tracing::warn!(job = worker.handler.job_name(), error = %e, "Job poll failed");
                        }
                    }
                }
            }

            // Every permit back means every running job has finished
            let _ = worker.permits.acquire_many(worker.config.concurrency as u32).await;
            tracing::info!(job = worker.handler.job_name(), "Job worker stopped");
        })
    }

    /// Claim as many jobs as there are free slots and spawn them
    pub async fn poll(self: &Arc<Self>) -> Result<usize> {
        let free = self.permits.available_permits().min(self.config.batch_size);
        if free == 0 {
            return Ok(0);
        }

        let jobs = self.queue.fetch(self.handler.job_name(), free, now()).await?;
        let claimed = jobs.len();

        for job in jobs {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                worker.execute(job).await;
                drop(permit);
            });
        }

        Ok(claimed)
    }

    /// Claim one batch and run it to completion on the caller's task
    pub async fn run_pending(&self) -> Result<usize> {
        let jobs = self
            .queue
            .fetch(self.handler.job_name(), self.config.batch_size, now())
            .await?;
        let claimed = jobs.len();

        futures::stream::iter(jobs)
            .for_each_concurrent(self.config.concurrency, |job| self.execute(job))
            .await;

        Ok(claimed)
    }

    async fn execute(&self, job: Job) {
        let started = Instant::now();
        let job_name = self.handler.job_name();
        let result = self.handler.handle(&job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let recorded = match result {
            Ok(()) => {
                tracing::debug!(job = job_name, job_id = %job.id, elapsed_ms, "Job completed");
                self.queue.complete(&job, now()).await.map(|_| ())
            }
            Err(err) if err.is_retryable() => {
                let error = err.to_string();
                match self.queue.fail(&job, &error, now()).await {
                    Ok(FailOutcome::Retrying { attempt, start_after }) => {
                        tracing::warn!(
                            job = job_name,
                            job_id = %job.id,
                            attempt,
                            retry_at = %start_after,
                            error = %error,
                            "Job failed, retry scheduled"
                        );
                        Ok(())
                    }
                    Ok(FailOutcome::Exhausted) => {
                        tracing::error!(job = job_name, job_id = %job.id, error = %error, "Job failed, retries exhausted");
                        Ok(())
                    }
                    Ok(FailOutcome::ClaimLost) => {
                        tracing::warn!(
                            job = job_name,
                            job_id = %job.id,
                            error = %error,
                            "Job failed after its claim expired, failure not recorded"
                        );
                        Ok(())
                    }
                    Ok(FailOutcome::Superseded) => {
                        tracing::info!(
                            job = job_name,
                            job_id = %job.id,
                            error = %error,
                            "Job failed, a newer queued job replaces it"
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(err @ MathJobError::Malformed(_)) => {
                tracing::warn!(job = job_name, job_id = %job.id, error = %err, "Dropping job");
                self.queue.fail_permanently(&job, &err.to_string(), now()).await.map(|_| ())
            }
            Err(err) => {
                tracing::error!(job = job_name, job_id = %job.id, error = %err, "Job failed permanently");
                self.queue.fail_permanently(&job, &err.to_string(), now()).await.map(|_| ())
            }
        };

        if let Err(e) = recorded {
            // The job stays active until expiry requeues it
            tracing::error!(job = job_name, job_id = %job.id, error = %e, "Failed to record job outcome");
        }
    }
}
