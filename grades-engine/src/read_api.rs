//! Grade reads
//!
//! Point reads compute and persist a course grade on demand when it is
//! missing or stale. Frozen courses are never written: their reads fall back
//! to a read-only evaluation. Bulk reads prefetch one batch of learners at a
//! time and report errors per learner.

use crate::context::GradeContext;
use crate::directory::LearnerDirectory;
use crate::engine::course::is_stale;
use crate::engine::{CourseGradeEngine, CourseGradeSummary, SubsectionScore};
use crate::error::{GradesError, Result};
use crate::reports::ReportFilter;
use crate::stores::{CourseGradeRow, GradeStores, OverrideHistoryEntry, SubsectionGradeRow, SubsectionOverride};
use crate::structure::CourseStructure;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use grades_common::{CourseKey, LearnerId, UsageKey};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A learner's course grade as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseGrade {
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub percent: f64,
    pub letter_grade: Option<String>,
    pub passed: bool,
    pub passed_at: Option<DateTime<Utc>>,
    /// False for read-only evaluations of frozen courses
    pub persisted: bool,
}

impl From<&CourseGradeRow> for CourseGrade {
    fn from(row: &CourseGradeRow) -> Self {
        Self {
            learner_id: row.learner_id,
            course_id: row.course_id.clone(),
            percent: row.percent_grade,
            letter_grade: row.letter_grade.clone(),
            passed: row.passed,
            passed_at: row.passed_at,
            persisted: true,
        }
    }
}

impl From<&CourseGradeSummary> for CourseGrade {
    fn from(summary: &CourseGradeSummary) -> Self {
        Self {
            learner_id: summary.learner_id,
            course_id: summary.course_id.clone(),
            percent: summary.result.percent,
            letter_grade: summary.result.letter_grade.clone(),
            passed: summary.result.passed,
            passed_at: None,
            persisted: false,
        }
    }
}

/// One item of a bulk read
#[derive(Debug)]
pub struct CourseGradeResult {
    pub learner_id: LearnerId,
    pub grade: Result<CourseGrade>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsectionGradeView {
    pub learner_id: LearnerId,
    pub grade: SubsectionScore,
    /// `None` for a subsection the learner never touched
    pub row: Option<SubsectionGradeRow>,
    pub active_override: Option<SubsectionOverride>,
    /// Newest first
    pub history: Vec<OverrideHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradebookEntry {
    pub learner_id: LearnerId,
    pub username: String,
    pub email: String,
    pub external_user_key: Option<String>,
    pub summary: CourseGradeSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradebookPage {
    pub entries: Vec<GradebookEntry>,
    /// Pass as `after` to fetch the next page; `None` on the last page
    pub next_after: Option<LearnerId>,
}

#[derive(Clone)]
pub struct GradeReader {
    structure: Arc<dyn CourseStructure>,
    directory: Arc<dyn LearnerDirectory>,
    stores: GradeStores,
    courses: CourseGradeEngine,
    batch_size: usize,
}

impl GradeReader {
    pub fn new(
        structure: Arc<dyn CourseStructure>,
        directory: Arc<dyn LearnerDirectory>,
        stores: GradeStores,
        courses: CourseGradeEngine,
        batch_size: usize,
    ) -> Self {
        Self {
            structure,
            directory,
            stores,
            courses,
            batch_size: batch_size.max(1),
        }
    }

    /// Course grade for an enrolled learner; `None` when not enrolled
    pub async fn get_course_grade(&self, learner_id: LearnerId, course: &CourseKey) -> Result<Option<CourseGrade>> {
        if self.directory.enrollment(learner_id, course).await?.is_none() {
            debug!(learner_id, course = %course, "Grade read for learner not enrolled");
            return Ok(None);
        }
        let ctx = GradeContext::load(self.structure.as_ref(), course).await?;
        let frozen = self.stores.frozen.is_frozen(ctx.course_key()).await?;
        self.read(&ctx, learner_id, frozen).await.map(Some)
    }

    async fn read(&self, ctx: &GradeContext, learner_id: LearnerId, frozen: bool) -> Result<CourseGrade> {
        let existing = match ctx.course_grade(learner_id) {
            Some(prefetched) => prefetched.cloned(),
            None => self.stores.course_grades.get(learner_id, ctx.course_key()).await?,
        };
        match existing {
            Some(row) if frozen || !is_stale(ctx, &row) => Ok(CourseGrade::from(&row)),
            _ if frozen => {
                let summary = self.courses.summarize(ctx, learner_id).await?;
                Ok(CourseGrade::from(&summary))
            }
            existing => {
                debug!(
                    learner_id,
                    course = %ctx.course_key(),
                    missing = existing.is_none(),
                    "Computing course grade on read"
                );
                let row = self.courses.compute(ctx, learner_id, Uuid::new_v4(), None).await?;
                Ok(CourseGrade::from(&row))
            }
        }
    }

    async fn prepare(&self, course: &CourseKey) -> Result<(GradeContext, bool)> {
        let ctx = GradeContext::load(self.structure.as_ref(), course).await?;
        let frozen = self.stores.frozen.is_frozen(ctx.course_key()).await?;
        Ok((ctx, frozen))
    }

    /// Stream course grades for the given learners in batches
    ///
    /// Learners are assumed enrolled. A failure affects only the learners it
    /// concerns; the stream always yields one item per requested learner.
    pub fn iter_course_grades(
        &self,
        course: CourseKey,
        learners: Vec<LearnerId>,
    ) -> impl Stream<Item = CourseGradeResult> + '_ {
        async_stream::stream! {
            match self.prepare(&course).await {
                Err(e) => {
                    let message = e.to_string();
                    for learner_id in learners {
                        yield CourseGradeResult {
                            learner_id,
                            grade: Err(GradesError::ReportPartialFailure { learner_id, message: message.clone() }),
                        };
                    }
                }
                Ok((mut ctx, frozen)) => {
                    for batch in learners.chunks(self.batch_size) {
                        if let Err(e) = ctx.prefetch(&self.stores, batch).await {
                            let message = e.to_string();
                            for &learner_id in batch {
                                yield CourseGradeResult {
                                    learner_id,
                                    grade: Err(GradesError::ReportPartialFailure { learner_id, message: message.clone() }),
                                };
                            }
                            continue;
                        }
                        for &learner_id in batch {
                            let grade = self.read(&ctx, learner_id, frozen).await;
                            yield CourseGradeResult { learner_id, grade };
                        }
                    }
                }
            }
        }
    }

    /// Persisted subsection grade with its override and history
    ///
    /// A subsection with no persisted grade yields a zero grade from the
    /// structure and current scores; nothing is written.
    pub async fn get_subsection_grade(
        &self,
        learner_id: LearnerId,
        subsection: &UsageKey,
    ) -> Result<SubsectionGradeView> {
        match self.stores.subsection_grades.get(learner_id, subsection).await? {
            Some(row) => {
                let (active_override, history) = self.stores.overrides.read_with_history(row.id, None).await?;
                Ok(SubsectionGradeView {
                    learner_id,
                    grade: SubsectionScore::from(&row),
                    row: Some(row),
                    active_override,
                    history,
                })
            }
            None => {
                let ctx = GradeContext::load(self.structure.as_ref(), subsection.course_key()).await?;
                let grade = self
                    .courses
                    .subsections()
                    .preview(&ctx, learner_id, subsection, None, None)
                    .await?;
                Ok(SubsectionGradeView {
                    learner_id,
                    grade,
                    row: None,
                    active_override: None,
                    history: Vec::new(),
                })
            }
        }
    }

    /// One page of the course gradebook, filtered, ordered by learner id
    ///
    /// `next_after` is set only when another matching learner exists past
    /// the page.
    pub async fn gradebook_page(
        &self,
        course: &CourseKey,
        filter: &ReportFilter,
        after: Option<LearnerId>,
        page_size: usize,
    ) -> Result<GradebookPage> {
        let page_size = page_size.max(1);
        let mut ctx = GradeContext::load(self.structure.as_ref(), course).await?;
        let mut entries: Vec<GradebookEntry> = Vec::new();
        let mut cursor = after;

        loop {
            // One extra learner decides whether a next page exists
            let learners = self
                .directory
                .enrolled_learners(ctx.course_key(), cursor, page_size + 1)
                .await?;
            let Some(last) = learners.last() else {
                return Ok(GradebookPage {
                    entries,
                    next_after: None,
                });
            };
            cursor = Some(last.id());

            let candidates: Vec<_> = learners.iter().filter(|l| filter.matches_enrollment(l)).collect();
            let ids: Vec<LearnerId> = candidates.iter().map(|l| l.id()).collect();
            ctx.prefetch(&self.stores, &ids).await?;

            for learner in candidates {
                if !filter.matches_context(&ctx, learner.id()) {
                    continue;
                }
                if entries.len() == page_size {
                    return Ok(GradebookPage {
                        next_after: entries.last().map(|e| e.learner_id),
                        entries,
                    });
                }
                let summary = self.courses.summarize(&ctx, learner.id()).await?;
                entries.push(GradebookEntry {
                    learner_id: learner.id(),
                    username: learner.learner.username.clone(),
                    email: learner.learner.email.clone(),
                    external_user_key: learner.learner.external_user_key.clone(),
                    summary,
                });
            }
        }
    }
}
