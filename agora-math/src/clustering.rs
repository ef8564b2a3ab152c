//! Clustering service client
//!
//! The opinion-clustering computation runs out of process. It receives the
//! counted vote matrix of one conversation and answers with group
//! assignments, per-group statistics and (optionally) AI labels and
//! summaries per group.

use agora_common::counters::CountedVote;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("agora-math/", env!("CARGO_PKG_VERSION"));

/// Clustering client errors
#[derive(Debug, Error)]
pub enum ClusteringError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// One counted vote in the shape the service expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEntry {
    pub participant_id: i64,
    pub statement_id: i64,
    /// 1 agree, -1 disagree, 0 pass
    pub vote: i8,
}

impl From<&CountedVote> for VoteEntry {
    fn from(vote: &CountedVote) -> Self {
        Self {
            participant_id: vote.participant_id,
            statement_id: vote.opinion_id,
            vote: vote.option.as_score(),
        }
    }
}

/// Body of `POST {url}/math`
#[derive(Debug, Clone, Serialize)]
pub struct ClusterRequest {
    pub conversation_id: i64,
    pub conversation_slug_id: String,
    pub votes: Vec<VoteEntry>,
}

/// Group membership of one participant; `None` when unclustered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantAssignment {
    pub participant_id: i64,
    #[serde(default)]
    pub cluster_id: Option<u32>,
}

/// AI text describing one group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabel {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Response of the clustering service
///
/// Groups are keyed `"0"`, `"1"`, ... in `repness`,
/// `group_comment_stats` and `labels`. Fields this service does not
/// interpret are kept in `extra` and stored with the raw result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterResult {
    #[serde(default)]
    pub repness: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub group_comment_stats: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub participants: Vec<ParticipantAssignment>,
    #[serde(default)]
    pub labels: BTreeMap<String, ClusterLabel>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClusterResult {
    /// Groups present in every part of the result
    ///
    /// The service reports groups in three places; only groups that all
    /// three agree on are usable.
    pub fn reported_cluster_count(&self) -> usize {
        let assigned: BTreeSet<u32> = self.participants.iter().filter_map(|p| p.cluster_id).collect();
        self.repness
            .len()
            .min(self.group_comment_stats.len())
            .min(assigned.len())
    }

    /// Participants assigned to group `cluster_id`
    pub fn members(&self, cluster_id: u32) -> impl Iterator<Item = i64> + '_ {
        self.participants
            .iter()
            .filter(move |p| p.cluster_id == Some(cluster_id))
            .map(|p| p.participant_id)
    }
}

/// The clustering computation
#[async_trait]
pub trait ClusterEngine: Send + Sync {
    async fn compute(&self, request: &ClusterRequest) -> Result<ClusterResult, ClusteringError>;
}

/// [`ClusterEngine`] backed by the clustering HTTP service
pub struct HttpClusterEngine {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpClusterEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClusteringError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ClusteringError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ClusterEngine for HttpClusterEngine {
    async fn compute(&self, request: &ClusterRequest) -> Result<ClusterResult, ClusteringError> {
        let url = format!("{}/math", self.base_url);

        tracing::debug!(
            conversation_id = request.conversation_id,
            votes = request.votes.len(),
            url = %url,
            "Requesting clustering"
        );

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClusteringError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClusteringError::Api(status.as_u16(), error_text));
        }

        response
            .json::<ClusterResult>()
            .await
            .map_err(|e| ClusteringError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_keeps_unknown_fields() {
        let result: ClusterResult = serde_json::from_value(json!({
            "repness": {"0": [], "1": []},
            "group_comment_stats": {"0": {}, "1": {}},
            "participants": [
                {"participant_id": 1, "cluster_id": 0},
                {"participant_id": 2, "cluster_id": 1},
                {"participant_id": 3}
            ],
            "consensus": {"agree": []}
        }))
        .unwrap();

        assert_eq!(result.reported_cluster_count(), 2);
        assert_eq!(result.members(1).collect::<Vec<_>>(), vec![2]);
        assert!(result.extra.contains_key("consensus"));
        assert!(result.labels.is_empty());
    }

    #[test]
    fn test_cluster_count_is_smallest_report() {
        let result: ClusterResult = serde_json::from_value(json!({
            "repness": {"0": [], "1": [], "2": []},
            "group_comment_stats": {"0": {}, "1": {}, "2": {}},
            "participants": [
                {"participant_id": 1, "cluster_id": 0},
                {"participant_id": 2, "cluster_id": 1}
            ]
        }))
        .unwrap();

        assert_eq!(result.reported_cluster_count(), 2);
    }

    #[test]
    fn test_engine_trims_trailing_slash() {
        let engine = HttpClusterEngine::new("http://localhost:5001/", Duration::from_secs(1)).unwrap();
        assert_eq!(engine.base_url, "http://localhost:5001");
    }
}
