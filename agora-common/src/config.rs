//! Configuration loading
//!
//! Settings are resolved in priority order:
//! 1. Command-line arguments (applied by each binary after loading)
//! 2. Environment variables (`AGORA_*`)
//! 3. TOML configuration file
//! 4. Compiled defaults
//!
//! A missing TOML file is not an error: the service logs a warning and
//! starts with defaults. A malformed file or an out-of-range value is.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Path to the shared SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// HTTP port (each binary has its own default)
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub buffer: BufferSection,

    #[serde(default)]
    pub exports: ExportConfig,

    #[serde(default)]
    pub math: MathServiceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file, appending (stderr is always written)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Update-queue scanning and recomputation worker settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// How often the queue scanner wakes
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Per-conversation rate limit on recomputation
    #[serde(default = "default_min_time_between_updates_ms")]
    pub min_time_between_updates_ms: u64,

    /// Recomputation jobs running at once per worker process
    #[serde(default = "default_job_concurrency")]
    pub job_concurrency: usize,

    /// Jobs fetched per worker poll
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    #[serde(default = "default_job_retry_limit")]
    pub job_retry_limit: u32,

    #[serde(default = "default_job_retry_delay_ms")]
    pub job_retry_delay_ms: u64,

    /// Active jobs older than this are presumed crashed and requeued
    #[serde(default = "default_job_expire_ms")]
    pub job_expire_ms: u64,

    /// Warn when the oldest pending queue entry is older than this
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: u64,
}

/// Settings for one event buffer
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Items "processing" longer than this are marked failed.
    /// `None` disables stale cleanup for the buffer.
    #[serde(default)]
    pub stale_threshold_ms: Option<u64>,

    /// Stale cleanup cadence, in flush cycles
    #[serde(default = "default_stale_cleanup_every_n_flushes")]
    pub stale_cleanup_every_n_flushes: u32,
}

/// Where buffered events are held between request and flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStoreKind {
    /// Process memory (single instance)
    Memory,
    /// The shared database (several API instances, survives restarts)
    #[default]
    Sqlite,
}

/// Per-buffer settings (`[buffer.votes]`, `[buffer.imports]`, `[buffer.exports]`)
#[derive(Debug, Clone, Deserialize)]
pub struct BufferSection {
    #[serde(default)]
    pub store: BufferStoreKind,

    #[serde(default = "BufferConfig::votes")]
    pub votes: BufferConfig,

    #[serde(default = "BufferConfig::imports")]
    pub imports: BufferConfig,

    #[serde(default = "BufferConfig::exports")]
    pub exports: BufferConfig,
}

/// Export request policy
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Minimum time between two exports of the same conversation by one user
    #[serde(default = "default_export_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Days until a completed export expires
    #[serde(default = "default_export_expiry_days")]
    pub expiry_days: i64,

    /// Directory export files are written to
    #[serde(default = "default_export_dir")]
    pub output_dir: PathBuf,
}

/// External collaborators used by the recomputation worker
#[derive(Debug, Clone, Deserialize)]
pub struct MathServiceConfig {
    /// Base URL of the clustering service (`POST {url}/math`)
    #[serde(default = "default_clustering_url")]
    pub clustering_url: String,

    #[serde(default = "default_clustering_timeout_secs")]
    pub clustering_timeout_secs: u64,

    /// Base URL of the translation service; translations are skipped when unset
    #[serde(default)]
    pub translation_url: Option<String>,

    /// Per-language translation request timeout
    #[serde(default = "default_translation_timeout_secs")]
    pub translation_timeout_secs: u64,

    #[serde(default = "default_supported_languages")]
    pub supported_languages: Vec<String>,
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("agora").join("agora.db"))
        .unwrap_or_else(|| PathBuf::from("./agora_data/agora.db"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scan_interval_ms() -> u64 {
    2000
}

fn default_min_time_between_updates_ms() -> u64 {
    20_000
}

fn default_job_concurrency() -> usize {
    3
}

fn default_scan_batch_size() -> usize {
    10
}

fn default_job_retry_limit() -> u32 {
    3
}

fn default_job_retry_delay_ms() -> u64 {
    5000
}

fn default_job_expire_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_staleness_ms() -> u64 {
    5 * 60 * 1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_concurrency() -> usize {
    3
}

fn default_stale_cleanup_every_n_flushes() -> u32 {
    60
}

fn default_export_cooldown_seconds() -> u64 {
    300
}

fn default_export_expiry_days() -> i64 {
    7
}

fn default_export_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("agora").join("exports"))
        .unwrap_or_else(|| PathBuf::from("./agora_data/exports"))
}

fn default_clustering_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_clustering_timeout_secs() -> u64 {
    600
}

fn default_translation_timeout_secs() -> u64 {
    60
}

fn default_supported_languages() -> Vec<String> {
    ["en", "es", "fr", "de", "it", "pt", "ja", "zh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Minimum accepted scan interval
pub const MIN_SCAN_INTERVAL_MS: u64 = 2000;
/// Minimum accepted per-conversation rate limit
pub const MIN_TIME_BETWEEN_UPDATES_FLOOR_MS: u64 = 5000;
/// Upper bound on recomputation concurrency
pub const MAX_JOB_CONCURRENCY: usize = 10;
/// Upper bound on jobs fetched per poll
pub const MAX_SCAN_BATCH_SIZE: usize = 50;

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Open the configured log file for appending, creating parent directories
    pub fn open_file(&self) -> Result<Option<std::fs::File>> {
        let Some(path) = &self.file else {
            return Ok(None);
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Some(file))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            min_time_between_updates_ms: default_min_time_between_updates_ms(),
            job_concurrency: default_job_concurrency(),
            scan_batch_size: default_scan_batch_size(),
            job_retry_limit: default_job_retry_limit(),
            job_retry_delay_ms: default_job_retry_delay_ms(),
            job_expire_ms: default_job_expire_ms(),
            max_staleness_ms: default_max_staleness_ms(),
        }
    }
}

impl PipelineConfig {
    /// Reject values outside the supported bounds
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_ms < MIN_SCAN_INTERVAL_MS {
            return Err(Error::Config(format!(
                "scan_interval_ms must be at least {} (got {})",
                MIN_SCAN_INTERVAL_MS, self.scan_interval_ms
            )));
        }
        if self.min_time_between_updates_ms < MIN_TIME_BETWEEN_UPDATES_FLOOR_MS {
            return Err(Error::Config(format!(
                "min_time_between_updates_ms must be at least {} (got {})",
                MIN_TIME_BETWEEN_UPDATES_FLOOR_MS, self.min_time_between_updates_ms
            )));
        }
        if !(1..=MAX_JOB_CONCURRENCY).contains(&self.job_concurrency) {
            return Err(Error::Config(format!(
                "job_concurrency must be between 1 and {} (got {})",
                MAX_JOB_CONCURRENCY, self.job_concurrency
            )));
        }
        if !(1..=MAX_SCAN_BATCH_SIZE).contains(&self.scan_batch_size) {
            return Err(Error::Config(format!(
                "scan_batch_size must be between 1 and {} (got {})",
                MAX_SCAN_BATCH_SIZE, self.scan_batch_size
            )));
        }
        Ok(())
    }
}

impl BufferConfig {
    /// Vote buffer defaults: large batches, applied serially in one transaction
    pub fn votes() -> Self {
        Self {
            flush_interval_ms: 1000,
            max_batch_size: 1000,
            max_concurrency: 1,
            stale_threshold_ms: None,
            stale_cleanup_every_n_flushes: default_stale_cleanup_every_n_flushes(),
        }
    }

    /// Import buffer defaults
    pub fn imports() -> Self {
        Self {
            flush_interval_ms: 1000,
            max_batch_size: 10,
            max_concurrency: 3,
            stale_threshold_ms: Some(30 * 60 * 1000),
            stale_cleanup_every_n_flushes: default_stale_cleanup_every_n_flushes(),
        }
    }

    /// Export buffer defaults
    pub fn exports() -> Self {
        Self::imports()
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(Error::Config(format!("buffer.{}: flush_interval_ms must be > 0", name)));
        }
        if self.max_batch_size == 0 || self.max_concurrency == 0 {
            return Err(Error::Config(format!(
                "buffer.{}: max_batch_size and max_concurrency must be > 0",
                name
            )));
        }
        if self.stale_threshold_ms.is_some() && self.stale_cleanup_every_n_flushes == 0 {
            return Err(Error::Config(format!(
                "buffer.{}: stale_cleanup_every_n_flushes must be > 0",
                name
            )));
        }
        Ok(())
    }
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            store: BufferStoreKind::default(),
            votes: BufferConfig::votes(),
            imports: BufferConfig::imports(),
            exports: BufferConfig::exports(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_export_cooldown_seconds(),
            expiry_days: default_export_expiry_days(),
            output_dir: default_export_dir(),
        }
    }
}

impl Default for MathServiceConfig {
    fn default() -> Self {
        Self {
            clustering_url: default_clustering_url(),
            clustering_timeout_secs: default_clustering_timeout_secs(),
            translation_url: None,
            translation_timeout_secs: default_translation_timeout_secs(),
            supported_languages: default_supported_languages(),
        }
    }
}

impl MathServiceConfig {
    /// Upper bound on one recomputation's external calls
    pub fn max_job_runtime_ms(&self) -> u64 {
        let languages = self.supported_languages.len() as u64;
        (self.clustering_timeout_secs + self.translation_timeout_secs * languages) * 1000
    }
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            port: None,
            logging: LoggingConfig::default(),
            pipeline: PipelineConfig::default(),
            buffer: BufferSection::default(),
            exports: ExportConfig::default(),
            math: MathServiceConfig::default(),
        }
    }
}

impl TomlConfig {
    /// Load configuration from `path` (or the platform default location),
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                let config = Self::from_toml_str(&content)?;
                info!("Loaded configuration from {}", p.display());
                config
            }
            Some(ref p) => {
                warn!("Config file {} not found, using defaults", p.display());
                Self::default()
            }
            None => {
                warn!("Could not determine config directory, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML content without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Apply `AGORA_*` environment variables over file values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u64>("AGORA_SCAN_INTERVAL_MS")? {
            self.pipeline.scan_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("AGORA_MIN_TIME_BETWEEN_UPDATES_MS")? {
            self.pipeline.min_time_between_updates_ms = v;
        }
        if let Some(v) = env_parse::<usize>("AGORA_JOB_CONCURRENCY")? {
            self.pipeline.job_concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("AGORA_BATCH_SIZE")? {
            self.pipeline.scan_batch_size = v;
        }
        if let Ok(v) = std::env::var("AGORA_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AGORA_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("AGORA_CLUSTERING_URL") {
            self.math.clustering_url = v;
        }
        if let Ok(v) = std::env::var("AGORA_TRANSLATION_URL") {
            self.math.translation_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        // Expiry requeues an active job; a live recomputation must never look expired
        let max_runtime_ms = self.math.max_job_runtime_ms();
        if self.pipeline.job_expire_ms <= max_runtime_ms {
            return Err(Error::Config(format!(
                "pipeline.job_expire_ms must exceed the longest recomputation ({} ms: clustering timeout plus one translation timeout per language), got {}",
                max_runtime_ms, self.pipeline.job_expire_ms
            )));
        }
        self.buffer.votes.validate("votes")?;
        self.buffer.imports.validate("imports")?;
        self.buffer.exports.validate("exports")?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid number: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// `~/.config/agora/config.toml` (platform equivalent elsewhere)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agora").join("config.toml"))
}
