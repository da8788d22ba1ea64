//! Course grade computation
//!
//! Evaluates the grading policy over graded subsection percentages,
//! persists the result and emits pass/fail transition events.

use crate::context::GradeContext;
use crate::engine::subsection::{SubsectionGradeEngine, SubsectionScore};
use crate::error::Result;
use crate::policy::{PolicyResult, SubsectionPercent};
use crate::stores::{
    CourseGradeRow, CourseGradeStore, CourseGradeWrite, FrozenGuard, ScoreStore, SubsectionGradeStore,
};
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{EventBus, GradeEvent};
use grades_common::time;
use grades_common::{CourseKey, LearnerId};
use serde::Serialize;
use sqlx::SqlitePool;
use std::borrow::Cow;
use tracing::{debug, info};
use uuid::Uuid;

/// Course grade with the inputs it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseGradeSummary {
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub result: PolicyResult,
    /// Graded subsections in course order
    pub subsections: Vec<SubsectionScore>,
    pub grading_policy_hash: String,
    pub course_edited_at: DateTime<Utc>,
}

/// Policy evaluation over effective subsection values
///
/// Subsections without an assignment type do not contribute.
pub fn evaluate(ctx: &GradeContext, subsections: &[SubsectionScore]) -> PolicyResult {
    let percents: Vec<SubsectionPercent> = subsections
        .iter()
        .filter_map(|score| {
            let info = ctx.view().subsection(&score.subsection_id)?;
            Some(SubsectionPercent {
                assignment_type: info.format.clone()?,
                percent: score.percent_graded(),
            })
        })
        .collect();
    ctx.view().grading_policy.evaluate(&percents)
}

/// Whether a persisted grade predates the current structure or policy
pub fn is_stale(ctx: &GradeContext, row: &CourseGradeRow) -> bool {
    row.course_edited_at != ctx.view().edited_at || row.grading_policy_hash != ctx.policy_hash()
}

#[derive(Clone)]
pub struct CourseGradeEngine {
    pool: SqlitePool,
    subsections: SubsectionGradeEngine,
    subsection_grades: SubsectionGradeStore,
    scores: ScoreStore,
    frozen: FrozenGuard,
    bus: EventBus,
    max_lock_wait_ms: u64,
}

impl CourseGradeEngine {
    pub fn new(
        pool: SqlitePool,
        subsections: SubsectionGradeEngine,
        frozen: FrozenGuard,
        bus: EventBus,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            subsection_grades: SubsectionGradeStore::new(pool.clone()),
            scores: ScoreStore::new(pool.clone(), max_lock_wait_ms),
            pool,
            subsections,
            frozen,
            bus,
            max_lock_wait_ms,
        }
    }

    pub fn subsections(&self) -> &SubsectionGradeEngine {
        &self.subsections
    }

    /// Evaluate without writing anything
    ///
    /// Persisted subsection grades are used as-is; missing ones are
    /// aggregated from current scores.
    pub async fn summarize(&self, ctx: &GradeContext, learner_id: LearnerId) -> Result<CourseGradeSummary> {
        let persisted = match ctx.subsection_grades(learner_id) {
            Some(rows) => Cow::Borrowed(rows),
            None => Cow::Owned(self.subsection_grades.for_learner(learner_id, ctx.course_key()).await?),
        };
        let scores = match ctx.scores(learner_id) {
            Some(scores) => Cow::Borrowed(scores),
            None => Cow::Owned(self.scores.for_learner(learner_id, ctx.course_key()).await?),
        };

        let mut subsections = Vec::new();
        for info in ctx.view().graded_subsections() {
            let score = self
                .subsections
                .preview(
                    ctx,
                    learner_id,
                    &info.usage_key,
                    persisted.get(&info.usage_key),
                    Some(&*scores),
                )
                .await?;
            subsections.push(score);
        }

        Ok(CourseGradeSummary {
            learner_id,
            course_id: ctx.course_key().clone(),
            result: evaluate(ctx, &subsections),
            subsections,
            grading_policy_hash: ctx.policy_hash().to_string(),
            course_edited_at: ctx.view().edited_at,
        })
    }

    /// Recompute, persist and announce a learner's course grade
    ///
    /// Missing subsection grades are created first. `as_of` is the time of
    /// the triggering change; a first pass is stamped with the later of it
    /// and the learner's most recent live score.
    pub async fn compute(
        &self,
        ctx: &GradeContext,
        learner_id: LearnerId,
        event_transaction_id: Uuid,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<CourseGradeRow> {
        self.frozen.ensure_not_frozen(ctx.course_key()).await?;

        let mut subsections = Vec::new();
        for info in ctx.view().graded_subsections() {
            let row = self
                .subsections
                .ensure(ctx, learner_id, &info.usage_key, event_transaction_id)
                .await?;
            subsections.push(SubsectionScore::from(&row));
        }
        let result = evaluate(ctx, &subsections);

        let latest_score = self.scores.latest_modified(learner_id, ctx.course_key()).await?;
        let passed_at = match (as_of, latest_score) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => time::now(),
        };

        let write = CourseGradeWrite {
            learner_id,
            course_id: ctx.course_key().clone(),
            course_edited_at: ctx.view().edited_at,
            grading_policy_hash: ctx.policy_hash().to_string(),
            percent_grade: result.percent,
            letter_grade: result.letter_grade.clone(),
            passed: result.passed,
            passed_at: Some(passed_at),
        };

        let (previous, row) = retry_on_lock("course grade write", self.max_lock_wait_ms, || {
            self.persist_once(&write)
        })
        .await?;

        debug!(
            learner_id,
            course = %row.course_id,
            percent = row.percent_grade,
            letter = ?row.letter_grade,
            passed = row.passed,
            "Course grade persisted"
        );
        self.announce(&row, previous.as_ref(), event_transaction_id);
        Ok(row)
    }

    async fn persist_once(
        &self,
        write: &CourseGradeWrite,
    ) -> Result<(Option<CourseGradeRow>, CourseGradeRow)> {
        let mut tx = self.pool.begin().await?;
        let previous = CourseGradeStore::get_in_tx(&mut tx, write.learner_id, &write.course_id).await?;
        let row = CourseGradeStore::upsert_in_tx(&mut tx, write).await?;
        tx.commit().await?;
        Ok((previous, row))
    }

    fn announce(&self, row: &CourseGradeRow, previous: Option<&CourseGradeRow>, event_transaction_id: Uuid) {
        let timestamp = time::now();
        let learner_id = row.learner_id;
        let course_id = row.course_id.clone();

        self.bus.emit_lossy(GradeEvent::CourseGradeChanged {
            event_transaction_id,
            learner_id,
            course_id: course_id.clone(),
            percent: row.percent_grade,
            letter_grade: row.letter_grade.clone(),
            passed: row.passed,
            passed_at: row.passed_at,
            timestamp,
        });

        // No prior row counts as failing
        let was_passing = previous.is_some_and(|p| p.passed);
        let had_passed = previous.is_some_and(|p| p.passed_at.is_some());

        if row.passed && !was_passing {
            info!(learner_id, course = %course_id, "Learner now passing");
            self.bus.emit_lossy(GradeEvent::CourseGradeNowPassed {
                event_transaction_id,
                learner_id,
                course_id: course_id.clone(),
                timestamp,
            });
        }
        if row.passed && !had_passed {
            self.bus.emit_lossy(GradeEvent::CourseGradePassedFirstTime {
                event_transaction_id,
                learner_id,
                course_id: course_id.clone(),
                timestamp,
            });
        }
        if !row.passed && was_passing {
            info!(learner_id, course = %course_id, "Learner no longer passing");
            self.bus.emit_lossy(GradeEvent::CourseGradeNowFailed {
                event_transaction_id,
                learner_id,
                course_id,
                timestamp,
            });
        }
    }
}
