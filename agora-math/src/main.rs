//! Agora Math (agora-math) - Main entry point
//!
//! Scans the update queue and recomputes conversation clusters through the
//! external clustering service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use agora_common::config::TomlConfig;
use agora_common::db::init_database;
use agora_common::events::EventBus;
use agora_math::{build_router, MathService};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 5801;

/// Command-line arguments for agora-math
#[derive(Parser, Debug)]
#[command(name = "agora-math")]
#[command(about = "Update-queue scanner and cluster recomputation for Agora")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "AGORA_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overrides the configuration
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Port for the health endpoint [default: 5801]
    #[arg(short, long, env = "AGORA_MATH_PORT")]
    port: Option<u16>,

    /// Log level, overrides the configuration (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let log_file = config.logging.open_file().context("Failed to open log file")?;
    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agora_math={0},agora_common={0},tower_http=info", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    info!("Starting Agora Math on port {}", port);
    info!("Database: {}", config.database_path.display());
    if let Some(path) = &config.logging.file {
        info!("Log file: {}", path.display());
    }
    info!(
        scan_interval_ms = config.pipeline.scan_interval_ms,
        min_time_between_updates_ms = config.pipeline.min_time_between_updates_ms,
        job_concurrency = config.pipeline.job_concurrency,
        clustering_url = %config.math.clustering_url,
        "Pipeline configuration"
    );

    let db = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    let service = MathService::new(db, EventBus::new(1000), &config).context("Failed to build math service")?;
    service.recover().await.context("Startup recovery failed")?;
    let tasks = service.start();

    let app = build_router(service.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Running recomputations finish; queued jobs wait for the next start
    service.shutdown();
    for handle in tasks {
        let _ = handle.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
