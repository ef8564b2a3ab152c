//! Conversation counters
//!
//! `opinion_count`, `vote_count` and `participant_count` are cached on the
//! conversation row, moved incrementally on the hot path and periodically
//! reconciled against the source tables. Every count in the system is
//! derived from the predicates defined once in this module:
//!
//! - an opinion counts when it is not soft-deleted and has no moderation row
//!   (and, for `opinion_count`, its author is not deleted)
//! - a vote counts when it is not cancelled, its author is not deleted and
//!   its opinion counts
//! - a participant is a distinct author of a counted vote

use crate::db::VoteOption;
use crate::time::to_millis;
use crate::update_queue;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};

// SQL fragments, aliased `o` (opinion), `v` (vote), `u` (counted author)
macro_rules! visible_opinion {
    () => {
        "o.is_deleted = 0 AND NOT EXISTS (SELECT 1 FROM opinion_moderation m WHERE m.opinion_id = o.id)"
    };
}

macro_rules! counted_vote {
    () => {
        concat!("v.option IS NOT NULL AND u.is_deleted = 0 AND ", visible_opinion!())
    };
}

const RECALCULATE_SQL: &str = concat!(
    "SELECT ",
    "(SELECT COUNT(*) FROM opinions o JOIN users u ON u.id = o.author_id ",
    "WHERE o.conversation_id = ?1 AND u.is_deleted = 0 AND ",
    visible_opinion!(),
    ") AS opinion_count, ",
    "(SELECT COUNT(*) FROM votes v JOIN opinions o ON o.id = v.opinion_id JOIN users u ON u.id = v.author_id ",
    "WHERE o.conversation_id = ?1 AND ",
    counted_vote!(),
    ") AS vote_count, ",
    "(SELECT COUNT(DISTINCT v.author_id) FROM votes v JOIN opinions o ON o.id = v.opinion_id JOIN users u ON u.id = v.author_id ",
    "WHERE o.conversation_id = ?1 AND ",
    counted_vote!(),
    ") AS participant_count"
);

/// Cached aggregate counters of one conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversationCounters {
    pub opinion_count: i64,
    pub vote_count: i64,
    pub participant_count: i64,
}

impl ConversationCounters {
    /// `self - other`, field by field
    pub fn diff(&self, other: &ConversationCounters) -> ConversationCounters {
        ConversationCounters {
            opinion_count: self.opinion_count - other.opinion_count,
            vote_count: self.vote_count - other.vote_count,
            participant_count: self.participant_count - other.participant_count,
        }
    }
}

/// Incremental change applied on the hot path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub opinions: i64,
    pub votes: i64,
    pub participants: i64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.opinions == 0 && self.votes == 0 && self.participants == 0
    }
}

/// Result of [`reconcile_and_persist`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub before: ConversationCounters,
    pub after: ConversationCounters,
}

impl ReconcileOutcome {
    pub fn corrected(&self) -> bool {
        self.before != self.after
    }
}

/// Recompute counters from source tables (read-only)
pub async fn recalculate_counters<'e, E>(executor: E, conversation_id: i64) -> Result<ConversationCounters>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (opinion_count, vote_count, participant_count): (i64, i64, i64) =
        sqlx::query_as(RECALCULATE_SQL)
            .bind(conversation_id)
            .fetch_one(executor)
            .await?;

    Ok(ConversationCounters {
        opinion_count,
        vote_count,
        participant_count,
    })
}

/// Counters as currently cached on the conversation row
pub async fn stored_counters<'e, E>(executor: E, conversation_id: i64) -> Result<ConversationCounters>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64, i64, i64)> = sqlx::query_as(
        "SELECT opinion_count, vote_count, participant_count FROM conversations WHERE id = ?",
    )
    .bind(conversation_id)
    .fetch_optional(executor)
    .await?;

    let (opinion_count, vote_count, participant_count) =
        row.ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;

    Ok(ConversationCounters {
        opinion_count,
        vote_count,
        participant_count,
    })
}

/// Recalculate counters and correct any drift in the cached columns
///
/// Always bumps `last_reacted_at`, even when nothing drifted (activity that
/// cancelled itself out is still activity). Safe to call arbitrarily often.
pub async fn reconcile_and_persist(
    pool: &SqlitePool,
    conversation_id: i64,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    let mut tx = pool.begin().await?;

    let before = stored_counters(&mut *tx, conversation_id).await?;
    let after = recalculate_counters(&mut *tx, conversation_id).await?;
    let now_ms = to_millis(now);

    if before != after {
        let diff = after.diff(&before);
        tracing::info!(
            conversation_id,
            before_opinions = before.opinion_count,
            before_votes = before.vote_count,
            before_participants = before.participant_count,
            after_opinions = after.opinion_count,
            after_votes = after.vote_count,
            after_participants = after.participant_count,
            diff_opinions = diff.opinion_count,
            diff_votes = diff.vote_count,
            diff_participants = diff.participant_count,
            "Counter drift corrected"
        );

        sqlx::query(
            r#"
            UPDATE conversations
            SET opinion_count = ?2, vote_count = ?3, participant_count = ?4,
                last_reacted_at = ?5, updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(conversation_id)
        .bind(after.opinion_count)
        .bind(after.vote_count)
        .bind(after.participant_count)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query("UPDATE conversations SET last_reacted_at = ?2 WHERE id = ?1")
            .bind(conversation_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(ReconcileOutcome { before, after })
}

/// Apply a hot-path delta to the cached counters (never below zero)
pub async fn apply_counter_delta(
    conn: &mut SqliteConnection,
    conversation_id: i64,
    delta: CounterDelta,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE conversations
        SET opinion_count = MAX(opinion_count + ?2, 0),
            vote_count = MAX(vote_count + ?3, 0),
            participant_count = MAX(participant_count + ?4, 0),
            last_reacted_at = ?5
        WHERE id = ?1
        "#,
    )
    .bind(conversation_id)
    .bind(delta.opinions)
    .bind(delta.votes)
    .bind(delta.participants)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Move the vote/participant counters and queue the conversation for recomputation
///
/// Called once per touched conversation by every vote flush, inside the
/// flush transaction so the counters and the dirty signal commit together.
pub async fn update_vote_count(
    conn: &mut SqliteConnection,
    conversation_id: i64,
    vote_delta: i64,
    participant_delta: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let delta = CounterDelta {
        opinions: 0,
        votes: vote_delta,
        participants: participant_delta,
    };
    apply_counter_delta(&mut *conn, conversation_id, delta, now).await?;
    update_queue::mark_dirty(&mut *conn, conversation_id, now).await?;
    Ok(())
}

/// A vote that counts, as handed to the clustering computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountedVote {
    /// Integer identity of the voter (`users.participant_id`)
    pub participant_id: i64,
    pub opinion_id: i64,
    pub option: VoteOption,
}

const COUNTED_VOTES_SQL: &str = concat!(
    "SELECT u.participant_id, v.opinion_id, v.option ",
    "FROM votes v JOIN opinions o ON o.id = v.opinion_id JOIN users u ON u.id = v.author_id ",
    "WHERE o.conversation_id = ?1 AND ",
    counted_vote!(),
    " ORDER BY u.participant_id, v.opinion_id"
);

/// Every vote of the conversation that [`recalculate_counters`] would count
pub async fn counted_votes<'e, E>(executor: E, conversation_id: i64) -> Result<Vec<CountedVote>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64, i64, String)> = sqlx::query_as(COUNTED_VOTES_SQL)
        .bind(conversation_id)
        .fetch_all(executor)
        .await?;

    rows.into_iter()
        .map(|(participant_id, opinion_id, option)| {
            Ok(CountedVote {
                participant_id,
                opinion_id,
                option: VoteOption::parse(&option)?,
            })
        })
        .collect()
}
