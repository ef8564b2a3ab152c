//! Translation of cluster labels and summaries
//!
//! Translations are generated for every supported language other than the
//! conversation's own, before anything is written, so that a translation
//! failure leaves no partial result behind.

use crate::clustering::ClusterLabel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("agora-math/", env!("CARGO_PKG_VERSION"));

/// Translation client errors
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Batch text translation
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `texts` in order; the result has the same length
    async fn translate(
        &self,
        texts: &[String],
        source_language: &str,
        target_language: &str,
    ) -> Result<Vec<String>, TranslationError>;
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    texts: &'a [String],
    source_language: &'a str,
    target_language: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translations: Vec<String>,
}

/// [`Translator`] backed by the translation HTTP service (`POST {url}/translate`)
pub struct HttpTranslator {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTranslator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TranslationError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| TranslationError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        texts: &[String],
        source_language: &str,
        target_language: &str,
    ) -> Result<Vec<String>, TranslationError> {
        let url = format!("{}/translate", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&TranslateRequest {
                texts,
                source_language,
                target_language,
            })
            .send()
            .await
            .map_err(|e| TranslationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TranslationError::Api(status.as_u16(), error_text));
        }

        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::Parse(e.to_string()))?;

        if body.translations.len() != texts.len() {
            return Err(TranslationError::Parse(format!(
                "expected {} translations, got {}",
                texts.len(),
                body.translations.len()
            )));
        }

        Ok(body.translations)
    }
}

/// Translated label and summary of one cluster in one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTranslation {
    pub cluster_key: String,
    pub language_code: String,
    pub ai_label: Option<String>,
    pub ai_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Label,
    Summary,
}

/// Translate every label and summary into each target language
///
/// One batch call per language. Clusters without any text produce no rows.
pub async fn translate_cluster_labels(
    translator: &dyn Translator,
    labels: &BTreeMap<String, ClusterLabel>,
    source_language: &str,
    target_languages: &[String],
) -> Result<Vec<ClusterTranslation>, TranslationError> {
    let mut texts = Vec::new();
    let mut mapping = Vec::new();

    for (key, label) in labels {
        if let Some(text) = label.label.as_ref().filter(|t| !t.is_empty()) {
            texts.push(text.clone());
            mapping.push((key.as_str(), TextKind::Label));
        }
        if let Some(text) = label.summary.as_ref().filter(|t| !t.is_empty()) {
            texts.push(text.clone());
            mapping.push((key.as_str(), TextKind::Summary));
        }
    }

    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let mut translations = Vec::new();

    for target in target_languages {
        let translated = translator.translate(&texts, source_language, target).await?;

        let mut per_cluster: BTreeMap<&str, ClusterTranslation> = BTreeMap::new();
        for ((key, kind), text) in mapping.iter().zip(translated) {
            let entry = per_cluster.entry(*key).or_insert_with(|| ClusterTranslation {
                cluster_key: key.to_string(),
                language_code: target.clone(),
                ai_label: None,
                ai_summary: None,
            });
            match kind {
                TextKind::Label => entry.ai_label = Some(text),
                TextKind::Summary => entry.ai_summary = Some(text),
            }
        }

        translations.extend(per_cluster.into_values());
    }

    tracing::debug!(
        texts = texts.len(),
        languages = target_languages.len(),
        rows = translations.len(),
        "Cluster labels translated"
    );

    Ok(translations)
}

/// Supported languages other than the source
pub fn target_languages(supported: &[String], source_language: &str) -> Vec<String> {
    supported
        .iter()
        .filter(|lang| lang.as_str() != source_language)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bracketing;

    #[async_trait]
    impl Translator for Bracketing {
        async fn translate(
            &self,
            texts: &[String],
            _source: &str,
            target: &str,
        ) -> Result<Vec<String>, TranslationError> {
            Ok(texts.iter().map(|t| format!("[{}] {}", target, t)).collect())
        }
    }

    fn label(label: Option<&str>, summary: Option<&str>) -> ClusterLabel {
        ClusterLabel {
            label: label.map(str::to_string),
            summary: summary.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_translations_map_back_to_clusters() {
        let mut labels = BTreeMap::new();
        labels.insert("0".to_string(), label(Some("Cyclists"), Some("Want lanes")));
        labels.insert("1".to_string(), label(Some("Drivers"), None));
        labels.insert("2".to_string(), label(None, None));

        let targets = vec!["es".to_string(), "fr".to_string()];
        let rows = translate_cluster_labels(&Bracketing, &labels, "en", &targets).await.unwrap();

        assert_eq!(rows.len(), 4);
        let drivers_fr = rows
            .iter()
            .find(|r| r.cluster_key == "1" && r.language_code == "fr")
            .unwrap();
        assert_eq!(drivers_fr.ai_label.as_deref(), Some("[fr] Drivers"));
        assert_eq!(drivers_fr.ai_summary, None);

        let cyclists_es = rows
            .iter()
            .find(|r| r.cluster_key == "0" && r.language_code == "es")
            .unwrap();
        assert_eq!(cyclists_es.ai_summary.as_deref(), Some("[es] Want lanes"));
    }

    #[tokio::test]
    async fn test_no_text_means_no_calls() {
        let mut labels = BTreeMap::new();
        labels.insert("0".to_string(), label(None, Some("")));

        let rows = translate_cluster_labels(&Bracketing, &labels, "en", &["es".to_string()])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_target_languages_exclude_source() {
        let supported: Vec<String> = ["en", "es", "fr"].iter().map(|s| s.to_string()).collect();
        assert_eq!(target_languages(&supported, "es"), vec!["en", "fr"]);
    }
}
