//! Vote buffering
//!
//! Votes are keyed by `voter:opinion`; a burst of changes by one voter on
//! one opinion collapses to the latest. A flush applies votes in chunks of at
//! most [`MAX_VOTES_PER_TRANSACTION`], one transaction per chunk, moving the
//! per-opinion tallies and the conversation counters by deltas and marking
//! every changed conversation dirty in the same transaction.
//!
//! Delta rules, per vote:
//! - new vote: +1 on the option, +1 vote, +1 participant if first in the conversation
//! - change of option: -1 old option, +1 new option
//! - cancel of an active vote: -1 on the option, -1 vote
//! - vote after a cancel: +1 on the option, +1 vote
//! - same option again, or cancel of nothing: no change
//!
//! Drift from these deltas (moderation, deletes, replays) is corrected by the
//! counter reconciliation that runs before every recomputation.

use crate::buffer::{BufferedEvent, FlushHandler, ItemOutcome};
use agora_common::counters::update_vote_count;
use agora_common::db::{retry_on_lock, VoteOption, DEFAULT_MAX_LOCK_WAIT_MS};
use agora_common::time::{now, to_millis};
use agora_common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};

/// Upper bound on votes written in one transaction
pub const MAX_VOTES_PER_TRANSACTION: usize = 5000;

/// What the voter did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingAction {
    Agree,
    Disagree,
    Pass,
    Cancel,
}

impl VotingAction {
    /// Option recorded on the vote row (`None` for a cancel)
    pub fn option(&self) -> Option<VoteOption> {
        match self {
            VotingAction::Agree => Some(VoteOption::Agree),
            VotingAction::Disagree => Some(VoteOption::Disagree),
            VotingAction::Pass => Some(VoteOption::Pass),
            VotingAction::Cancel => None,
        }
    }
}

/// A vote waiting in the buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedVote {
    pub user_id: String,
    pub opinion_id: i64,
    pub action: VotingAction,
    /// Client event time in ms; orders votes for the same key
    pub timestamp_ms: i64,
}

impl BufferedEvent for BufferedVote {
    fn dedupe_key(&self) -> String {
        format!("{}:{}", self.user_id, self.opinion_id)
    }

    fn score(&self) -> i64 {
        self.timestamp_ms
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if self.opinion_id <= 0 {
            return Err(format!("invalid opinion_id {}", self.opinion_id));
        }
        if self.timestamp_ms <= 0 {
            return Err("timestamp_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Per-opinion tally change
#[derive(Debug, Default, Clone, Copy)]
struct TallyDelta {
    agrees: i64,
    disagrees: i64,
    passes: i64,
}

impl TallyDelta {
    fn add(&mut self, option: VoteOption, n: i64) {
        match option {
            VoteOption::Agree => self.agrees += n,
            VoteOption::Disagree => self.disagrees += n,
            VoteOption::Pass => self.passes += n,
        }
    }

    fn is_zero(&self) -> bool {
        self.agrees == 0 && self.disagrees == 0 && self.passes == 0
    }
}

/// State of an existing vote row
enum Existing {
    None,
    Cancelled,
    Active(VoteOption),
}

/// Writes buffered votes to the primary store
pub struct VoteFlushHandler {
    db: SqlitePool,
}

impl VoteFlushHandler {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Apply one chunk in one transaction, starting over if the database is locked
    async fn apply_chunk(&self, votes: &[BufferedVote]) -> Result<Vec<ItemOutcome>> {
        retry_on_lock("apply vote chunk", DEFAULT_MAX_LOCK_WAIT_MS, move || self.try_apply_chunk(votes)).await
    }

    async fn try_apply_chunk(&self, votes: &[BufferedVote]) -> Result<Vec<ItemOutcome>> {
        let now = now();
        let now_ms = to_millis(now);
        let mut tx = self.db.begin().await?;

        let mut outcomes = Vec::with_capacity(votes.len());
        let mut opinion_conversations: HashMap<i64, Option<i64>> = HashMap::new();
        let mut live_users: HashMap<String, bool> = HashMap::new();
        let mut tallies: HashMap<i64, TallyDelta> = HashMap::new();
        let mut conversation_deltas: HashMap<i64, (i64, i64)> = HashMap::new();
        let mut new_participants: HashSet<(i64, String)> = HashSet::new();
        let mut changed: HashSet<i64> = HashSet::new();

        for vote in votes {
            let conversation_id = match opinion_conversations.get(&vote.opinion_id) {
                Some(cached) => *cached,
                None => {
                    let found = votable_opinion_conversation(&mut *tx, vote.opinion_id).await?;
                    opinion_conversations.insert(vote.opinion_id, found);
                    found
                }
            };
            let Some(conversation_id) = conversation_id else {
                outcomes.push(ItemOutcome::Failed(format!(
                    "opinion {} not found or not votable",
                    vote.opinion_id
                )));
                continue;
            };

            let user_live = match live_users.get(&vote.user_id) {
                Some(live) => *live,
                None => {
                    let live = user_is_live(&mut *tx, &vote.user_id).await?;
                    live_users.insert(vote.user_id.clone(), live);
                    live
                }
            };
            if !user_live {
                outcomes.push(ItemOutcome::Failed(format!("user {} not found", vote.user_id)));
                continue;
            }

            let existing = existing_vote(&mut *tx, &vote.user_id, vote.opinion_id).await?;
            let first_in_conversation = matches!(existing, Existing::None)
                && !new_participants.contains(&(conversation_id, vote.user_id.clone()))
                && !has_voted_in_conversation(&mut *tx, conversation_id, &vote.user_id).await?;

            let tally = tallies.entry(vote.opinion_id).or_default();
            let counts = conversation_deltas.entry(conversation_id).or_insert((0, 0));

            let applied = match (existing, vote.action.option()) {
                (Existing::None, Some(option)) => {
                    insert_vote(&mut *tx, vote, option, now_ms).await?;
                    tally.add(option, 1);
                    counts.0 += 1;
                    if first_in_conversation {
                        counts.1 += 1;
                        new_participants.insert((conversation_id, vote.user_id.clone()));
                    }
                    true
                }
                (Existing::Cancelled, Some(option)) => {
                    set_vote_option(&mut *tx, vote, Some(option), now_ms).await?;
                    tally.add(option, 1);
                    counts.0 += 1;
                    true
                }
                (Existing::Active(old), Some(option)) if old != option => {
                    set_vote_option(&mut *tx, vote, Some(option), now_ms).await?;
                    tally.add(old, -1);
                    tally.add(option, 1);
                    true
                }
                (Existing::Active(old), None) => {
                    set_vote_option(&mut *tx, vote, None, now_ms).await?;
                    tally.add(old, -1);
                    counts.0 -= 1;
                    true
                }
                // Same option again, or cancel with nothing to cancel
                _ => false,
            };
            if applied {
                changed.insert(conversation_id);
            }

            outcomes.push(ItemOutcome::Applied);
        }

        for (opinion_id, delta) in &tallies {
            if delta.is_zero() {
                continue;
            }
            sqlx::query(
                r#"
                UPDATE opinions
                SET num_agrees = MAX(num_agrees + ?2, 0),
                    num_disagrees = MAX(num_disagrees + ?3, 0),
                    num_passes = MAX(num_passes + ?4, 0),
                    updated_at = ?5
                WHERE id = ?1
                "#,
            )
            .bind(opinion_id)
            .bind(delta.agrees)
            .bind(delta.disagrees)
            .bind(delta.passes)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }

        // Conversations where only no-ops landed are left alone
        for conversation_id in changed {
            let (votes_delta, participants_delta) =
                conversation_deltas.get(&conversation_id).copied().unwrap_or((0, 0));
            update_vote_count(&mut *tx, conversation_id, votes_delta, participants_delta, now).await?;
        }

        tx.commit().await?;

        Ok(outcomes)
    }
}

#[async_trait]
impl FlushHandler for VoteFlushHandler {
    type Event = BufferedVote;

    fn name(&self) -> &'static str {
        "votes"
    }

    async fn apply_one(&self, event: &BufferedVote) -> Result<ItemOutcome> {
        let mut outcomes = self.apply_chunk(std::slice::from_ref(event)).await?;
        Ok(outcomes.pop().unwrap_or(ItemOutcome::Applied))
    }

    /// Votes are applied serially in transactions of bounded size; the
    /// concurrency setting does not apply.
    async fn apply_batch(
        &self,
        events: &[BufferedVote],
        _max_concurrency: usize,
    ) -> Result<Vec<ItemOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for chunk in events.chunks(MAX_VOTES_PER_TRANSACTION) {
            outcomes.extend(self.apply_chunk(chunk).await?);
        }

        tracing::debug!(votes = events.len(), "Applied buffered votes");
        Ok(outcomes)
    }
}

/// Conversation of an opinion that can still receive votes
async fn votable_opinion_conversation(
    conn: &mut SqliteConnection,
    opinion_id: i64,
) -> Result<Option<i64>> {
    let conversation_id: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT o.conversation_id
        FROM opinions o
        JOIN conversations c ON c.id = o.conversation_id
        WHERE o.id = ? AND o.is_deleted = 0 AND c.is_deleted = 0
        "#,
    )
    .bind(opinion_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(conversation_id)
}

async fn user_is_live(conn: &mut SqliteConnection, user_id: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ? AND is_deleted = 0")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(found.is_some())
}

async fn existing_vote(conn: &mut SqliteConnection, user_id: &str, opinion_id: i64) -> Result<Existing> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT option FROM votes WHERE author_id = ? AND opinion_id = ?")
            .bind(user_id)
            .bind(opinion_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(match row {
        None => Existing::None,
        Some((None,)) => Existing::Cancelled,
        Some((Some(option),)) => Existing::Active(VoteOption::parse(&option)?),
    })
}

async fn has_voted_in_conversation(
    conn: &mut SqliteConnection,
    conversation_id: i64,
    user_id: &str,
) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT 1 FROM votes v
        JOIN opinions o ON o.id = v.opinion_id
        WHERE o.conversation_id = ? AND v.author_id = ?
        LIMIT 1
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(found.is_some())
}

async fn insert_vote(
    conn: &mut SqliteConnection,
    vote: &BufferedVote,
    option: VoteOption,
    now_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO votes (author_id, opinion_id, option, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&vote.user_id)
    .bind(vote.opinion_id)
    .bind(option.as_str())
    .bind(vote.timestamp_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn set_vote_option(
    conn: &mut SqliteConnection,
    vote: &BufferedVote,
    option: Option<VoteOption>,
    now_ms: i64,
) -> Result<()> {
    sqlx::query("UPDATE votes SET option = ?, updated_at = ? WHERE author_id = ? AND opinion_id = ?")
        .bind(option.map(|o| o.as_str()))
        .bind(now_ms)
        .bind(&vote.user_id)
        .bind(vote.opinion_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}
