//! Per-block score store
//!
//! One row per (learner, block). Each row is owned by the source that first
//! wrote it; writes from the other source are refused. Older events never
//! overwrite newer rows, and `only_if_higher` writes are dropped unless they
//! improve on the stored score.

use crate::error::{GradesError, Result};
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{ScoreSource, WeightedScoreChanged};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct BlockScore {
    pub learner_id: LearnerId,
    pub block_id: UsageKey,
    pub course_id: CourseKey,
    pub raw_earned: f64,
    pub raw_possible: f64,
    pub weight: Option<f64>,
    pub source: ScoreSource,
    pub modified_at: DateTime<Utc>,
    pub deleted: bool,
    pub grader_response: Option<String>,
}

impl BlockScore {
    /// (earned, possible) after applying the block weight
    pub fn weighted(&self) -> (f64, f64) {
        if self.deleted {
            return (0.0, 0.0);
        }
        weighted_score(self.raw_earned, self.raw_possible, self.weight)
    }

    /// Whether this row carries the same values as a score change
    pub fn matches(&self, change: &WeightedScoreChanged) -> bool {
        if self.deleted || change.deleted {
            return self.deleted == change.deleted;
        }
        self.raw_earned == change.raw_earned
            && self.raw_possible == change.raw_possible
            && self.weight == change.weight
    }
}

/// Scale raw points by a block weight
///
/// With a weight and positive raw possible, earned becomes
/// `raw_earned / raw_possible * weight` and possible becomes `weight`;
/// otherwise the raw values pass through.
pub fn weighted_score(raw_earned: f64, raw_possible: f64, weight: Option<f64>) -> (f64, f64) {
    match weight {
        Some(w) if raw_possible > 0.0 => (raw_earned / raw_possible * w, w),
        _ => (raw_earned, raw_possible),
    }
}

/// Order scores by ratio then by possible; (0, 0) ranks lowest
fn compare_scores(a: (f64, f64), b: (f64, f64)) -> Ordering {
    let ratio = |(e, p): (f64, f64)| if p > 0.0 { e / p } else { 0.0 };
    ratio(a)
        .total_cmp(&ratio(b))
        .then_with(|| a.1.total_cmp(&b.1))
}

/// Result of a score write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    /// Row written; carries the committed `modified_at`
    Written(DateTime<Utc>),
    /// `only_if_higher` write did not improve on the stored score
    NotHigher,
    /// A newer event already landed for this row
    Superseded(DateTime<Utc>),
}

/// Reject negative values and earned above possible
pub fn validate_score(raw_earned: f64, raw_possible: f64, weight: Option<f64>) -> Result<()> {
    if !(raw_earned >= 0.0) || !(raw_possible >= 0.0) {
        return Err(GradesError::InvalidScore(format!(
            "Negative or non-numeric score {}/{}",
            raw_earned, raw_possible
        )));
    }
    if raw_earned > raw_possible {
        return Err(GradesError::InvalidScore(format!(
            "Earned {} exceeds possible {}",
            raw_earned, raw_possible
        )));
    }
    if weight.is_some_and(|w| !(w >= 0.0)) {
        return Err(GradesError::InvalidScore("Negative weight".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ScoreStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

const SELECT_COLUMNS: &str = "learner_id, block_id, course_id, raw_earned, raw_possible, weight, \
     source, modified_at, deleted, grader_response";

impl ScoreStore {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    /// Apply a normalized score change
    pub async fn upsert(&self, change: &WeightedScoreChanged) -> Result<UpsertOutcome> {
        if !change.deleted {
            validate_score(change.raw_earned, change.raw_possible, change.weight)?;
        }
        retry_on_lock("score upsert", self.max_lock_wait_ms, || self.upsert_once(change)).await
    }

    async fn upsert_once(&self, change: &WeightedScoreChanged) -> Result<UpsertOutcome> {
        let block_id = change.block_id.normalized();
        let modified_at = time::truncate(change.modified_at);
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {} FROM block_scores WHERE learner_id = ? AND block_id = ?",
            SELECT_COLUMNS
        ))
        .bind(change.learner_id)
        .bind(block_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row_to_score(&row))
        .transpose()?;

        if let Some(current) = &existing {
            if current.source != change.source {
                return Err(GradesError::SourceMismatch {
                    block: block_id.to_string(),
                    owner: current.source,
                    writer: change.source,
                });
            }
            if current.modified_at > modified_at {
                debug!(
                    learner_id = change.learner_id,
                    block = %block_id,
                    "Ignoring score older than stored row"
                );
                return Ok(UpsertOutcome::Superseded(current.modified_at));
            }
            if change.only_if_higher && !change.deleted {
                let stored = current.weighted();
                let incoming =
                    weighted_score(change.raw_earned, change.raw_possible, change.weight);
                if compare_scores(incoming, stored) != Ordering::Greater {
                    return Ok(UpsertOutcome::NotHigher);
                }
            }
        }

        let (raw_earned, raw_possible) = if change.deleted {
            (0.0, 0.0)
        } else {
            (change.raw_earned, change.raw_possible)
        };

        sqlx::query(
            r#"
            INSERT INTO block_scores (
                learner_id, block_id, course_id, raw_earned, raw_possible, weight,
                source, modified_at, deleted, grader_response, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(learner_id, block_id) DO UPDATE SET
                raw_earned = excluded.raw_earned,
                raw_possible = excluded.raw_possible,
                weight = excluded.weight,
                modified_at = excluded.modified_at,
                deleted = excluded.deleted,
                grader_response = COALESCE(excluded.grader_response, block_scores.grader_response)
            "#,
        )
        .bind(change.learner_id)
        .bind(block_id.to_string())
        .bind(change.course_id.normalized().to_string())
        .bind(raw_earned)
        .bind(raw_possible)
        .bind(change.weight)
        .bind(change.source.as_str())
        .bind(time::to_db(&modified_at))
        .bind(change.deleted)
        .bind(change.grader_response.as_deref())
        .bind(time::to_db(&time::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UpsertOutcome::Written(modified_at))
    }

    pub async fn get(&self, learner_id: LearnerId, block: &UsageKey) -> Result<Option<BlockScore>> {
        sqlx::query(&format!(
            "SELECT {} FROM block_scores WHERE learner_id = ? AND block_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(block.normalized().to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_score(&row))
        .transpose()
    }

    /// All of a learner's rows in a course, keyed by block
    pub async fn for_learner(
        &self,
        learner_id: LearnerId,
        course: &CourseKey,
    ) -> Result<HashMap<UsageKey, BlockScore>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM block_scores WHERE learner_id = ? AND course_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(course.normalized().to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row_to_score(row).map(|s| (s.block_id.clone(), s)))
            .collect()
    }

    /// Bulk prefetch for a batch of learners
    pub async fn for_learners(
        &self,
        course: &CourseKey,
        learners: &[LearnerId],
    ) -> Result<HashMap<LearnerId, HashMap<UsageKey, BlockScore>>> {
        let mut out: HashMap<LearnerId, HashMap<UsageKey, BlockScore>> = HashMap::new();
        if learners.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT {} FROM block_scores WHERE course_id = ? AND learner_id IN ({})",
            SELECT_COLUMNS,
            placeholders(learners.len())
        );
        let mut query = sqlx::query(&sql).bind(course.normalized().to_string());
        for id in learners {
            query = query.bind(*id);
        }
        for row in query.fetch_all(&self.pool).await? {
            let score = row_to_score(&row)?;
            out.entry(score.learner_id)
                .or_default()
                .insert(score.block_id.clone(), score);
        }
        Ok(out)
    }

    /// Latest modification time over a learner's live scores in a course
    pub async fn latest_modified(
        &self,
        learner_id: LearnerId,
        course: &CourseKey,
    ) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(modified_at) FROM block_scores WHERE learner_id = ? AND course_id = ? AND deleted = 0",
        )
        .bind(learner_id)
        .bind(course.normalized().to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(time::opt_from_db(latest)?)
    }
}

/// `?, ?, ?` for an IN clause
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_score(row: &SqliteRow) -> Result<BlockScore> {
    let block_id: String = row.try_get("block_id")?;
    let course_id: String = row.try_get("course_id")?;
    let source: String = row.try_get("source")?;
    let modified_at: String = row.try_get("modified_at")?;
    Ok(BlockScore {
        learner_id: row.try_get("learner_id")?,
        block_id: block_id.parse()?,
        course_id: course_id.parse()?,
        raw_earned: row.try_get("raw_earned")?,
        raw_possible: row.try_get("raw_possible")?,
        weight: row.try_get("weight")?,
        source: source.parse()?,
        modified_at: time::from_db(&modified_at)?,
        deleted: row.try_get("deleted")?,
        grader_response: row.try_get("grader_response")?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    pub fn change(
        learner_id: LearnerId,
        block: &UsageKey,
        earned: f64,
        possible: f64,
        modified_at: DateTime<Utc>,
    ) -> WeightedScoreChanged {
        WeightedScoreChanged {
            event_transaction_id: Uuid::new_v4(),
            learner_id,
            course_id: block.course_key().clone(),
            block_id: block.clone(),
            weighted_earned: earned,
            weighted_possible: possible,
            raw_earned: earned,
            raw_possible: possible,
            weight: None,
            source: ScoreSource::BlockState,
            modified_at: time::truncate(modified_at),
            only_if_higher: false,
            deleted: false,
            grader_response: None,
        }
    }

    pub fn later(ts: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        ts + Duration::milliseconds(ms)
    }
}
