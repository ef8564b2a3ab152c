//! agora-math library interface
//!
//! Recomputation side of the pipeline: the durable job queue, the queue
//! scanner that turns dirty conversations into jobs, and the workers that
//! run the clustering recomputation.

pub mod api;
pub mod clustering;
pub mod error;
pub mod jobs;
pub mod math_job;
pub mod persistence;
pub mod scanner;
pub mod translation;
pub mod worker;

pub use crate::error::MathJobError;

use crate::clustering::{ClusterEngine, HttpClusterEngine};
use crate::jobs::JobQueue;
use crate::math_job::MathJobHandler;
use crate::scanner::QueueScanner;
use crate::translation::{HttpTranslator, Translator};
use crate::worker::{Worker, WorkerConfig};
use agora_common::config::{PipelineConfig, TomlConfig};
use agora_common::events::EventBus;
use agora_common::time::now;
use agora_common::{Error, Result};
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const WORKER_POLL_INTERVAL_MS: u64 = 500;
const MAINTENANCE_INTERVAL_SECS: u64 = 60;
/// Finished jobs are kept this long for inspection
const JOB_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// The recomputation service, shared with HTTP handlers
#[derive(Clone)]
pub struct MathService {
    pub db: SqlitePool,
    pub queue: JobQueue,
    pub pipeline: PipelineConfig,
    pub scan_worker: Arc<Worker<QueueScanner>>,
    pub math_worker: Arc<Worker<MathJobHandler>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    cancel: CancellationToken,
}

impl MathService {
    /// Build the service with HTTP clients for clustering and translation
    pub fn new(db: SqlitePool, event_bus: EventBus, config: &TomlConfig) -> Result<Self> {
        let engine = HttpClusterEngine::new(
            &config.math.clustering_url,
            Duration::from_secs(config.math.clustering_timeout_secs),
        )
        .map_err(|e| Error::Config(format!("clustering client: {}", e)))?;

        let translator: Option<Arc<dyn Translator>> = match &config.math.translation_url {
            Some(url) => Some(Arc::new(
                HttpTranslator::new(url, Duration::from_secs(config.math.translation_timeout_secs))
                    .map_err(|e| Error::Config(format!("translation client: {}", e)))?,
            )),
            None => {
                tracing::info!("No translation service configured, cluster translations disabled");
                None
            }
        };

        Ok(Self::with_collaborators(db, event_bus, config, Arc::new(engine), translator))
    }

    pub fn with_collaborators(
        db: SqlitePool,
        event_bus: EventBus,
        config: &TomlConfig,
        engine: Arc<dyn ClusterEngine>,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        let pipeline = config.pipeline.clone();
        let queue = JobQueue::new(db.clone());
        let cancel = CancellationToken::new();
        let poll_interval = Duration::from_millis(WORKER_POLL_INTERVAL_MS);

        let scanner = QueueScanner::new(db.clone(), queue.clone(), &pipeline);
        let scan_worker = Worker::new(
            queue.clone(),
            Arc::new(scanner),
            WorkerConfig {
                concurrency: 1,
                batch_size: 1,
                poll_interval,
            },
            cancel.child_token(),
        );

        let math = MathJobHandler::new(
            db.clone(),
            engine,
            translator,
            event_bus,
            Duration::from_millis(pipeline.min_time_between_updates_ms),
            config.math.supported_languages.clone(),
        );
        let math_worker = Worker::new(
            queue.clone(),
            Arc::new(math),
            WorkerConfig {
                concurrency: pipeline.job_concurrency,
                batch_size: pipeline.scan_batch_size,
                poll_interval,
            },
            cancel.child_token(),
        );

        Self {
            db,
            queue,
            pipeline,
            scan_worker,
            math_worker,
            startup_time: Utc::now(),
            cancel,
        }
    }

    /// Startup recovery: requeue jobs left active by a crashed process and
    /// make sure the scan loop exists
    pub async fn recover(&self) -> Result<()> {
        let now = now();
        let expired = self
            .queue
            .expire_active(Duration::from_millis(self.pipeline.job_expire_ms), now)
            .await?;
        if expired > 0 {
            tracing::info!(expired, "Recovered jobs from a previous run");
        }

        self.scan_worker.handler().ensure_loop(&self.pipeline, now).await?;
        Ok(())
    }

    /// Periodic housekeeping: expiry, scan-loop watchdog and purge
    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<()> {
        self.queue
            .expire_active(Duration::from_millis(self.pipeline.job_expire_ms), now)
            .await?;

        if self.scan_worker.handler().ensure_loop(&self.pipeline, now).await? {
            tracing::warn!("Scan loop was missing and has been reseeded");
        }

        self.queue
            .purge(Duration::from_secs(JOB_RETENTION_SECS), now)
            .await?;
        Ok(())
    }

    /// Start both workers and the housekeeping loop
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let service = self.clone();
        let maintenance = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick fires immediately; recovery already covered it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.maintain(now()).await {
                            tracing::warn!(error = %e, "Job queue maintenance failed");
                        }
                    }
                }
            }
        });

        vec![self.scan_worker.start(), self.math_worker.start(), maintenance]
    }

    /// Stop claiming jobs; running jobs finish before the worker tasks exit
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Build application router
pub fn build_router(service: MathService) -> Router {
    Router::new()
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
