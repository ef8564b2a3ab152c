//! Error types for agora-math

use crate::clustering::ClusteringError;
use crate::translation::TranslationError;
use thiserror::Error;

/// Outcome of a failed job, classified by what the job system should do next
#[derive(Debug, Error)]
pub enum MathJobError {
    /// External service or database hiccup; the job system retries
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Data integrity problem (e.g. the conversation vanished); logged, never retried
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// Payload missing required fields; dropped
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl MathJobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MathJobError::Transient(_))
    }
}

impl From<agora_common::Error> for MathJobError {
    fn from(err: agora_common::Error) -> Self {
        match err {
            agora_common::Error::NotFound(what) => MathJobError::Fatal(format!("{} not found", what)),
            other => MathJobError::Transient(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for MathJobError {
    fn from(err: sqlx::Error) -> Self {
        MathJobError::from(agora_common::Error::from(err))
    }
}

impl From<ClusteringError> for MathJobError {
    fn from(err: ClusteringError) -> Self {
        MathJobError::Transient(format!("clustering: {}", err))
    }
}

impl From<TranslationError> for MathJobError {
    fn from(err: TranslationError) -> Self {
        MathJobError::Transient(format!("translation: {}", err))
    }
}
