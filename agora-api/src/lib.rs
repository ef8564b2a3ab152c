//! agora-api library interface
//!
//! Event buffers for votes, imports and exports, and the HTTP surface that
//! feeds them.

pub mod api;
pub mod buffer;
pub mod error;
pub mod exports;
pub mod imports;
pub mod records;
pub mod votes;

pub use crate::error::{ApiError, ApiResult};

use crate::buffer::{BufferStore, EventBuffer, FlushHandler, MemoryBufferStore, SqlBufferStore};
use crate::exports::{ConversationExporter, ExportFlushHandler, FileExporter};
use crate::imports::{ConversationImporter, DbImporter, ImportFlushHandler};
use crate::votes::VoteFlushHandler;
use agora_common::config::{BufferConfig, BufferStoreKind, ExportConfig, TomlConfig};
use agora_common::events::EventBus;
use agora_common::notifications::Notifier;
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub notifier: Notifier,
    pub votes: Arc<EventBuffer<VoteFlushHandler>>,
    pub imports: Arc<EventBuffer<ImportFlushHandler>>,
    pub exports: Arc<EventBuffer<ExportFlushHandler>>,
    pub export_config: ExportConfig,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Build the three buffers from configuration with the default importer and exporter
    pub fn new(db: SqlitePool, event_bus: EventBus, config: &TomlConfig) -> Self {
        Self::with_collaborators(
            db,
            event_bus,
            config,
            Arc::new(DbImporter),
            Arc::new(FileExporter::new(config.exports.output_dir.clone())),
        )
    }

    pub fn with_collaborators(
        db: SqlitePool,
        event_bus: EventBus,
        config: &TomlConfig,
        importer: Arc<dyn ConversationImporter>,
        exporter: Arc<dyn ConversationExporter>,
    ) -> Self {
        let notifier = Notifier::new(db.clone(), event_bus.clone());
        let kind = config.buffer.store;

        let votes = build_buffer(
            &db,
            kind,
            VoteFlushHandler::new(db.clone()),
            config.buffer.votes.clone(),
        );
        let imports = build_buffer(
            &db,
            kind,
            ImportFlushHandler::new(db.clone(), notifier.clone(), importer),
            config.buffer.imports.clone(),
        );
        let exports = build_buffer(
            &db,
            kind,
            ExportFlushHandler::new(db.clone(), notifier.clone(), exporter),
            config.buffer.exports.clone(),
        );

        Self {
            db,
            event_bus,
            notifier,
            votes,
            imports,
            exports,
            export_config: config.exports.clone(),
            startup_time: Utc::now(),
        }
    }

    /// Start the flush loops
    pub fn start_buffers(&self) -> Vec<JoinHandle<()>> {
        vec![self.votes.start(), self.imports.start(), self.exports.start()]
    }

    /// Stop accepting events and drain every buffer
    pub async fn shutdown_buffers(&self) {
        let results = [
            ("votes", self.votes.shutdown().await),
            ("imports", self.imports.shutdown().await),
            ("exports", self.exports.shutdown().await),
        ];

        for (name, result) in results {
            if let Err(e) = result {
                tracing::error!(buffer = name, error = %e, "Buffer drain failed, pending events left in store");
            }
        }
    }
}

fn build_buffer<H: FlushHandler>(
    db: &SqlitePool,
    kind: BufferStoreKind,
    handler: H,
    settings: BufferConfig,
) -> Arc<EventBuffer<H>> {
    let store: Arc<dyn BufferStore> = match kind {
        BufferStoreKind::Memory => Arc::new(MemoryBufferStore::new()),
        BufferStoreKind::Sqlite => Arc::new(SqlBufferStore::new(db.clone(), handler.name())),
    };
    EventBuffer::new(handler, store, settings)
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::vote_routes())
        .merge(api::import_routes())
        .merge(api::export_routes())
        .merge(api::queue_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
