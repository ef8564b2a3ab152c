//! Database models shared by both services

use crate::time::from_millis;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Status of a long-running import or export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Processing,
    Completed,
    Failed,
    /// Completed export past its expiry; the file is gone
    Expired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
            RecordStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(RecordStatus::Processing),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            "expired" => Ok(RecordStatus::Expired),
            other => Err(Error::Internal(format!("Unknown record status: {}", other))),
        }
    }
}

/// Why an import or export ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Still processing past the stale threshold
    Timeout,
    /// Processing raised an error
    ProcessingError,
    /// Buffered payload could not be decoded or validated
    InvalidPayload,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::ProcessingError => "processing_error",
            FailureReason::InvalidPayload => "invalid_payload",
        }
    }
}

/// A cast vote option (a cancelled vote has no option)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOption {
    Agree,
    Disagree,
    Pass,
}

impl VoteOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOption::Agree => "agree",
            VoteOption::Disagree => "disagree",
            VoteOption::Pass => "pass",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "agree" => Ok(VoteOption::Agree),
            "disagree" => Ok(VoteOption::Disagree),
            "pass" => Ok(VoteOption::Pass),
            other => Err(Error::InvalidInput(format!("Unknown vote option: {}", other))),
        }
    }

    /// Column holding the per-opinion tally for this option
    pub fn tally_column(&self) -> &'static str {
        match self {
            VoteOption::Agree => "num_agrees",
            VoteOption::Disagree => "num_disagrees",
            VoteOption::Pass => "num_passes",
        }
    }

    /// Numeric encoding expected by the clustering service
    pub fn as_score(&self) -> i8 {
        match self {
            VoteOption::Agree => 1,
            VoteOption::Disagree => -1,
            VoteOption::Pass => 0,
        }
    }
}

/// Row of `conversation_import`
#[derive(Debug, Clone, Serialize)]
pub struct ImportRecord {
    pub id: i64,
    pub slug_id: String,
    pub user_id: String,
    pub conversation_id: Option<i64>,
    pub status: RecordStatus,
    pub failure_reason: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportRecord {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            slug_id: row.try_get("slug_id")?,
            user_id: row.try_get("user_id")?,
            conversation_id: row.try_get("conversation_id")?,
            status: RecordStatus::parse(row.try_get::<&str, _>("status")?)?,
            failure_reason: row.try_get("failure_reason")?,
            error_message: row.try_get("error_message")?,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }
}

/// Row of `conversation_export`
#[derive(Debug, Clone, Serialize)]
pub struct ExportRecord {
    pub id: i64,
    pub slug_id: String,
    pub conversation_id: i64,
    pub user_id: String,
    pub status: RecordStatus,
    pub failure_reason: Option<String>,
    pub error_message: Option<String>,
    pub file_path: Option<String>,
    pub total_file_size: Option<i64>,
    pub total_file_count: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportRecord {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            slug_id: row.try_get("slug_id")?,
            conversation_id: row.try_get("conversation_id")?,
            user_id: row.try_get("user_id")?,
            status: RecordStatus::parse(row.try_get::<&str, _>("status")?)?,
            failure_reason: row.try_get("failure_reason")?,
            error_message: row.try_get("error_message")?,
            file_path: row.try_get("file_path")?,
            total_file_size: row.try_get("total_file_size")?,
            total_file_count: row.try_get("total_file_count")?,
            expires_at: from_millis(row.try_get("expires_at")?),
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }
}

/// Minimal conversation identity used across the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationRef {
    pub id: i64,
    pub slug_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_status_round_trips_through_column_text() {
        for status in [
            RecordStatus::Processing,
            RecordStatus::Completed,
            RecordStatus::Failed,
            RecordStatus::Expired,
        ] {
            assert_eq!(RecordStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RecordStatus::parse("queued").is_err());
    }

    #[test]
    fn test_vote_option_scores() {
        assert_eq!(VoteOption::Agree.as_score(), 1);
        assert_eq!(VoteOption::Disagree.as_score(), -1);
        assert_eq!(VoteOption::Pass.as_score(), 0);
        assert!(matches!(VoteOption::parse("cancel"), Err(Error::InvalidInput(_))));
    }
}
