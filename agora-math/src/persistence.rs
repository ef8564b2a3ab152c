//! Writing a clustering result
//!
//! One transaction per result: the raw result row, its clusters and their
//! members, the translations, and the conversation's pointer to the new
//! result. Readers switch from the previous result to the new one atomically.

use crate::clustering::ClusterResult;
use crate::translation::ClusterTranslation;
use agora_common::time::to_millis;
use agora_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;

/// Most clusters shown for one conversation
pub const MAX_CLUSTERS: usize = 6;

/// What [`persist_math_result`] wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMath {
    pub math_result_id: i64,
    pub cluster_count: usize,
    pub translation_count: usize,
}

/// Persist `result` as the current result of the conversation
///
/// Clusters are the groups `"0"..` reported consistently by the service,
/// at most [`MAX_CLUSTERS`]. Translations for clusters that were not kept
/// are skipped. Translation rows conflicting on `(cluster, language)` are
/// ignored.
pub async fn persist_math_result(
    conn: &mut SqliteConnection,
    conversation_id: i64,
    requested_at: DateTime<Utc>,
    result: &ClusterResult,
    translations: &[ClusterTranslation],
    now: DateTime<Utc>,
) -> Result<PersistedMath> {
    let now_ms = to_millis(now);
    let raw_data = serde_json::to_string(result)?;

    let math_result_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO math_results (conversation_id, requested_at, raw_data, created_at)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id
        "#,
    )
    .bind(conversation_id)
    .bind(to_millis(requested_at))
    .bind(&raw_data)
    .bind(now_ms)
    .fetch_one(&mut *conn)
    .await?;

    let reported = result.reported_cluster_count();
    if reported > MAX_CLUSTERS {
        tracing::warn!(
            conversation_id,
            reported,
            kept = MAX_CLUSTERS,
            "Clustering returned more clusters than can be shown, extra clusters dropped"
        );
    }
    let cluster_count = reported.min(MAX_CLUSTERS);

    let mut cluster_ids: HashMap<String, i64> = HashMap::with_capacity(cluster_count);

    for index in 0..cluster_count as u32 {
        let key = index.to_string();
        let members: Vec<i64> = result.members(index).collect();
        let label = result.labels.get(&key);

        let cluster_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO clusters (math_result_id, cluster_key, num_users, ai_label, ai_summary)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(math_result_id)
        .bind(&key)
        .bind(members.len() as i64)
        .bind(label.and_then(|l| l.label.as_deref()))
        .bind(label.and_then(|l| l.summary.as_deref()))
        .fetch_one(&mut *conn)
        .await?;

        for participant_id in members {
            sqlx::query("INSERT OR IGNORE INTO cluster_users (cluster_id, participant_id) VALUES (?, ?)")
                .bind(cluster_id)
                .bind(participant_id)
                .execute(&mut *conn)
                .await?;
        }

        cluster_ids.insert(key, cluster_id);
    }

    let mut translation_count = 0;
    for translation in translations {
        let Some(&cluster_id) = cluster_ids.get(&translation.cluster_key) else {
            tracing::debug!(
                conversation_id,
                cluster_key = %translation.cluster_key,
                "Translation for a dropped cluster skipped"
            );
            continue;
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO cluster_translation (cluster_id, language_code, ai_label, ai_summary, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(cluster_id, language_code) DO NOTHING
            "#,
        )
        .bind(cluster_id)
        .bind(&translation.language_code)
        .bind(&translation.ai_label)
        .bind(&translation.ai_summary)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;

        translation_count += inserted.rows_affected() as usize;
    }

    sqlx::query("UPDATE conversations SET current_math_result_id = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(conversation_id)
        .bind(math_result_id)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;

    Ok(PersistedMath {
        math_result_id,
        cluster_count,
        translation_count,
    })
}

/// Clusters of the conversation's current result: `(cluster_key, num_users, ai_label)`
pub async fn current_clusters(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<Vec<(String, i64, Option<String>)>> {
    let rows = sqlx::query_as(
        r#"
        SELECT cl.cluster_key, cl.num_users, cl.ai_label
        FROM conversations c
        JOIN clusters cl ON cl.math_result_id = c.current_math_result_id
        WHERE c.id = ?
        ORDER BY cl.cluster_key ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{ClusterLabel, ParticipantAssignment};
    use agora_common::db::init_database;
    use agora_common::store;
    use agora_common::time::now;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool, i64) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("math.db")).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        store::ensure_user(&mut conn, "author", "author", now()).await.unwrap();
        let conversation = store::create_conversation(&mut conn, "c1", "author", "Title", None, "en", now())
            .await
            .unwrap();
        drop(conn);
        (dir, pool, conversation.id)
    }

    fn result_with_groups(groups: u32) -> ClusterResult {
        let mut result = ClusterResult::default();
        for g in 0..groups {
            result.repness.insert(g.to_string(), json!([]));
            result.group_comment_stats.insert(g.to_string(), json!({}));
            result.participants.push(ParticipantAssignment {
                participant_id: i64::from(g) + 1,
                cluster_id: Some(g),
            });
        }
        result
    }

    #[tokio::test]
    async fn test_persist_caps_clusters_and_points_conversation_at_result() {
        let (_dir, pool, conversation_id) = setup().await;
        let mut result = result_with_groups(8);
        result.labels.insert(
            "0".to_string(),
            ClusterLabel {
                label: Some("Cyclists".to_string()),
                summary: None,
            },
        );

        let mut conn = pool.acquire().await.unwrap();
        let persisted = persist_math_result(&mut conn, conversation_id, now(), &result, &[], now())
            .await
            .unwrap();
        drop(conn);

        assert_eq!(persisted.cluster_count, MAX_CLUSTERS);
        let clusters = current_clusters(&pool, conversation_id).await.unwrap();
        assert_eq!(clusters.len(), MAX_CLUSTERS);
        assert_eq!(clusters[0], ("0".to_string(), 1, Some("Cyclists".to_string())));
    }

    #[tokio::test]
    async fn test_translations_are_idempotent_and_skip_dropped_clusters() {
        let (_dir, pool, conversation_id) = setup().await;
        let result = result_with_groups(2);
        let translation = |key: &str| ClusterTranslation {
            cluster_key: key.to_string(),
            language_code: "es".to_string(),
            ai_label: Some("Ciclistas".to_string()),
            ai_summary: None,
        };
        let translations = vec![translation("0"), translation("0"), translation("7")];

        let mut conn = pool.acquire().await.unwrap();
        let persisted = persist_math_result(&mut conn, conversation_id, now(), &result, &translations, now())
            .await
            .unwrap();

        assert_eq!(persisted.translation_count, 1);
    }
}
