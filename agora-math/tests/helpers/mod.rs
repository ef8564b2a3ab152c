//! Shared fixtures for agora-math integration tests

#![allow(dead_code)]

use agora_common::config::TomlConfig;
use agora_common::db::init_database;
use agora_common::events::EventBus;
use agora_common::store;
use agora_common::time::{now, to_millis};
use agora_common::update_queue;
use agora_math::clustering::{
    ClusterEngine, ClusterLabel, ClusterRequest, ClusterResult, ClusteringError, ParticipantAssignment,
};
use agora_math::translation::{TranslationError, Translator};
use agora_math::MathService;
use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Fresh database in a temp directory (keep the TempDir alive for the test)
pub async fn setup_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("temp dir");
    let pool = init_database(&temp_dir.path().join("agora.db"))
        .await
        .expect("init database");
    (temp_dir, pool)
}

/// Clustering stand-in: splits the voters round-robin into `groups`
pub struct FakeEngine {
    pub groups: u32,
    pub labels: bool,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    /// Marks this conversation dirty while "computing"
    pub dirty_during_compute: Mutex<Option<(SqlitePool, i64)>>,
    pub last_vote_count: AtomicUsize,
}

impl FakeEngine {
    fn build(groups: u32, labels: bool) -> Self {
        Self {
            groups,
            labels,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            dirty_during_compute: Mutex::new(None),
            last_vote_count: AtomicUsize::new(0),
        }
    }

    pub fn new(groups: u32) -> Arc<Self> {
        Arc::new(Self::build(groups, false))
    }

    pub fn labelled(groups: u32) -> Arc<Self> {
        Arc::new(Self::build(groups, true))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn dirty_while_computing(&self, pool: &SqlitePool, conversation_id: i64) {
        *self.dirty_during_compute.lock().unwrap() = Some((pool.clone(), conversation_id));
    }
}

#[async_trait]
impl ClusterEngine for FakeEngine {
    async fn compute(&self, request: &ClusterRequest) -> Result<ClusterResult, ClusteringError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_vote_count.store(request.votes.len(), Ordering::SeqCst);

        let hook = self.dirty_during_compute.lock().unwrap().clone();
        if let Some((pool, conversation_id)) = hook {
            update_queue::mark_dirty(&pool, conversation_id, now()).await.unwrap();
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(ClusteringError::Api(503, "clustering unavailable".to_string()));
        }

        let participants: BTreeSet<i64> = request.votes.iter().map(|v| v.participant_id).collect();
        let mut result = ClusterResult::default();
        for (i, participant_id) in participants.into_iter().enumerate() {
            result.participants.push(ParticipantAssignment {
                participant_id,
                cluster_id: Some(i as u32 % self.groups),
            });
        }
        for g in 0..self.groups {
            result.repness.insert(g.to_string(), json!([]));
            result.group_comment_stats.insert(g.to_string(), json!({}));
            if self.labels {
                result.labels.insert(
                    g.to_string(),
                    ClusterLabel {
                        label: Some(format!("Group {}", g)),
                        summary: Some(format!("Summary of group {}", g)),
                    },
                );
            }
        }
        Ok(result)
    }
}

/// Translator stand-in: prefixes each text with the target language
pub struct PrefixTranslator;

#[async_trait]
impl Translator for PrefixTranslator {
    async fn translate(
        &self,
        texts: &[String],
        _source_language: &str,
        target_language: &str,
    ) -> Result<Vec<String>, TranslationError> {
        Ok(texts.iter().map(|t| format!("{}: {}", target_language, t)).collect())
    }
}

pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.math.supported_languages = vec!["en".to_string(), "es".to_string(), "fr".to_string()];
    config
}

pub async fn setup_service(engine: Arc<FakeEngine>) -> (TempDir, MathService, EventBus) {
    let (dir, pool) = setup_db().await;
    let bus = EventBus::new(16);
    let service = MathService::with_collaborators(
        pool,
        bus.clone(),
        &test_config(),
        engine,
        Some(Arc::new(PrefixTranslator)),
    );
    (dir, service, bus)
}

pub async fn seed_user(pool: &SqlitePool, user_id: &str) {
    let mut conn = pool.acquire().await.unwrap();
    store::ensure_user(&mut conn, user_id, user_id, now()).await.unwrap();
}

pub async fn seed_conversation(pool: &SqlitePool, author_id: &str, slug: &str) -> i64 {
    seed_user(pool, author_id).await;
    let mut conn = pool.acquire().await.unwrap();
    store::create_conversation(&mut conn, slug, author_id, "Title", None, "en", now())
        .await
        .unwrap()
        .id
}

pub async fn seed_opinion(pool: &SqlitePool, conversation_id: i64, author_id: &str, slug: &str) -> i64 {
    seed_user(pool, author_id).await;
    let mut conn = pool.acquire().await.unwrap();
    store::create_opinion(&mut conn, conversation_id, slug, author_id, "content", now())
        .await
        .unwrap()
}

pub async fn insert_vote(pool: &SqlitePool, author_id: &str, opinion_id: i64, option: &str) {
    seed_user(pool, author_id).await;
    sqlx::query(
        r#"
        INSERT INTO votes (author_id, opinion_id, option, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT(author_id, opinion_id) DO UPDATE SET option = excluded.option
        "#,
    )
    .bind(author_id)
    .bind(opinion_id)
    .bind(option)
    .bind(to_millis(now()))
    .execute(pool)
    .await
    .unwrap();
}

/// Conversation with one opinion and `voters` agreeing votes, marked dirty
pub async fn voted_conversation(pool: &SqlitePool, slug: &str, voters: usize) -> i64 {
    let conversation_id = seed_conversation(pool, "author", slug).await;
    let opinion_id = seed_opinion(pool, conversation_id, "author", &format!("{}-o1", slug)).await;
    for n in 0..voters {
        insert_vote(pool, &format!("{}-voter-{}", slug, n), opinion_id, "agree").await;
    }
    update_queue::mark_dirty(pool, conversation_id, now()).await.unwrap();
    conversation_id
}
