//! Course-wide CSV reports
//!
//! Learners are paged from the directory in id order. Each page is
//! prefetched in bulk, rendered, flushed and checkpointed before the next
//! one starts, so a cancelled job resumes after its last complete page.
//! Per-learner failures become rows in the error CSV and the job goes on.

pub mod csv;
pub mod filter;
pub mod shapes;
pub mod store;

pub use filter::{AssignmentRange, ReportFilter};
pub use shapes::{ReportKind, ReportLayout, NOT_ATTEMPTED, NOT_AVAILABLE};
pub use store::{FsReportStore, MemoryReportStore, ReportStore};

use crate::context::GradeContext;
use crate::directory::{EnrolledLearner, LearnerDirectory};
use crate::engine::{CourseGradeEngine, SubsectionScore};
use crate::error::{GradesError, Result};
use crate::stores::{Checkpoint, GradeStores, ReportStatus, ReportTask, TaskProgress, VisibleBlocks};
use crate::structure::CourseStructure;
use csv::CsvFile;
use grades_common::events::{EventBus, GradeEvent};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use shapes::RowInput;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    pub course_id: CourseKey,
    pub kind: ReportKind,
    pub filter: ReportFilter,
}

#[derive(Clone)]
pub struct ReportGenerator {
    structure: Arc<dyn CourseStructure>,
    directory: Arc<dyn LearnerDirectory>,
    stores: GradeStores,
    courses: CourseGradeEngine,
    report_store: Arc<dyn ReportStore>,
    bus: EventBus,
    work_root: PathBuf,
    batch_size: usize,
}

impl ReportGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        structure: Arc<dyn CourseStructure>,
        directory: Arc<dyn LearnerDirectory>,
        stores: GradeStores,
        courses: CourseGradeEngine,
        report_store: Arc<dyn ReportStore>,
        bus: EventBus,
        work_root: PathBuf,
        batch_size: usize,
    ) -> Self {
        Self {
            structure,
            directory,
            stores,
            courses,
            report_store,
            bus,
            work_root,
            batch_size: batch_size.max(1),
        }
    }

    /// Create a report task and run it to completion or cancellation
    pub async fn start(&self, request: &ReportRequest, cancel: &CancellationToken) -> Result<ReportTask> {
        let course = request.course_id.normalized();
        // Fail before creating a task when the course cannot be read
        self.structure.snapshot(&course).await?;

        let total = self.directory.count_enrolled(&course).await?;
        let filters = serde_json::to_value(&request.filter)?;
        let work_dir = self.work_root.join(Uuid::new_v4().to_string());
        let task = self
            .stores
            .report_tasks
            .create(&course, request.kind.as_str(), &filters, total, &work_dir)
            .await?;
        info!(
            task_id = %task.task_id,
            course = %course,
            kind = %request.kind,
            total,
            filtered = !request.filter.is_empty(),
            "Report task created"
        );
        self.execute(task, cancel).await
    }

    /// Continue a cancelled or interrupted task from its checkpoint
    pub async fn resume(&self, task_id: Uuid, cancel: &CancellationToken) -> Result<ReportTask> {
        let task = self.stores.report_tasks.get(task_id).await?.ok_or_else(|| {
            GradesError::Common(grades_common::Error::NotFound(format!("Report task {}", task_id)))
        })?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        self.stores.report_tasks.set_status(task_id, ReportStatus::Running).await?;
        info!(
            task_id = %task_id,
            after = ?task.checkpoint.last_learner_id,
            attempted = task.progress.attempted,
            "Resuming report task"
        );
        self.execute(task, cancel).await
    }

    async fn execute(&self, task: ReportTask, cancel: &CancellationToken) -> Result<ReportTask> {
        let task_id = task.task_id;
        if let Err(e) = self.generate(&task, cancel).await {
            error!(task_id = %task_id, code = e.code(), error = %e, "Report task failed");
            if let Err(status_err) = self.stores.report_tasks.set_status(task_id, ReportStatus::Failed).await {
                error!(task_id = %task_id, error = %status_err, "Failed to mark report task failed");
            }
            return Err(e);
        }
        self.stores.report_tasks.get(task_id).await?.ok_or_else(|| {
            GradesError::FatalStoreError(format!("Report task {} disappeared", task_id))
        })
    }

    async fn generate(&self, task: &ReportTask, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let kind: ReportKind = task.report_kind.parse()?;
        let filter: ReportFilter = serde_json::from_value(task.filters.clone())?;
        let mut ctx = GradeContext::load(self.structure.as_ref(), &task.course_id).await?;
        let layout = ReportLayout::new(kind, ctx.view());

        let base = format!(
            "{}_{}",
            kind.file_stem(),
            task.created_at.format("%Y-%m-%d-%H%M%S")
        );
        let mut report = CsvFile::open(
            &task.work_dir.join(format!("{}.csv", base)),
            layout.header(),
            task.checkpoint.report_bytes,
        )
        .await?;
        let mut errors = CsvFile::open(
            &task.work_dir.join(format!("{}_err.csv", base)),
            &ReportLayout::error_header(),
            task.checkpoint.error_bytes,
        )
        .await?;

        let mut progress = task.progress;
        let mut after = task.checkpoint.last_learner_id;
        let mut visible: HashMap<String, VisibleBlocks> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                self.stores.report_tasks.set_status(task.task_id, ReportStatus::Cancelled).await?;
                info!(task_id = %task.task_id, after = ?after, "Report task cancelled");
                return Ok(());
            }

            let page = self
                .directory
                .enrolled_learners(&task.course_id, after, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let last_id = last.id();

            let candidates: Vec<&EnrolledLearner> =
                page.iter().filter(|l| filter.matches_enrollment(l)).collect();
            progress.skipped += (page.len() - candidates.len()) as u64;

            let ids: Vec<LearnerId> = candidates.iter().map(|l| l.id()).collect();
            ctx.prefetch(&self.stores, &ids).await?;
            if kind == ReportKind::Problem {
                self.load_visible(&ctx, &ids, &mut visible).await?;
            }

            for learner in candidates {
                match self.learner_row(&ctx, &layout, &filter, learner, &visible).await {
                    Ok(Some(cells)) => {
                        progress.attempted += 1;
                        progress.succeeded += 1;
                        report.write_row(&cells).await?;
                    }
                    Ok(None) => progress.skipped += 1,
                    Err(e) => {
                        progress.attempted += 1;
                        progress.failed += 1;
                        let failure = GradesError::ReportPartialFailure {
                            learner_id: learner.id(),
                            message: e.to_string(),
                        };
                        warn!(task_id = %task.task_id, code = failure.code(), "{}", failure);
                        errors
                            .write_row(&ReportLayout::error_row(
                                learner.id(),
                                &learner.learner.username,
                                &e.to_string(),
                            ))
                            .await?;
                    }
                }
            }

            report.flush().await?;
            errors.flush().await?;
            after = Some(last_id);
            self.stores
                .report_tasks
                .checkpoint(
                    task.task_id,
                    &progress,
                    &Checkpoint {
                        last_learner_id: after,
                        report_bytes: report.offset(),
                        error_bytes: errors.offset(),
                    },
                )
                .await?;
            self.announce(task, &progress);
            info!(
                task_id = %task.task_id,
                after = last_id,
                attempted = progress.attempted,
                failed = progress.failed,
                total = progress.total,
                "Report batch complete"
            );
        }

        let report_location = self
            .report_store
            .store(&task.course_id, &format!("{}.csv", base), report.path())
            .await?;
        let error_location = if progress.failed > 0 {
            Some(
                self.report_store
                    .store(&task.course_id, &format!("{}_err.csv", base), errors.path())
                    .await?,
            )
        } else {
            None
        };
        self.stores
            .report_tasks
            .complete(task.task_id, &report_location, error_location.as_deref())
            .await?;

        drop(report);
        drop(errors);
        if let Err(e) = tokio::fs::remove_dir_all(&task.work_dir).await {
            warn!(path = %task.work_dir.display(), error = %e, "Failed to remove report work dir");
        }
        info!(
            task_id = %task.task_id,
            location = %report_location,
            succeeded = progress.succeeded,
            failed = progress.failed,
            skipped = progress.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Report task succeeded"
        );
        Ok(())
    }

    /// Fetch visible-block records referenced by the batch that are not cached
    async fn load_visible(
        &self,
        ctx: &GradeContext,
        learners: &[LearnerId],
        cache: &mut HashMap<String, VisibleBlocks>,
    ) -> Result<()> {
        for learner_id in learners {
            let Some(rows) = ctx.subsection_grades(*learner_id) else {
                continue;
            };
            for row in rows.values() {
                if cache.contains_key(&row.visible_blocks_hash) {
                    continue;
                }
                if let Some(record) = self.stores.visible_blocks.get(&row.visible_blocks_hash).await? {
                    cache.insert(row.visible_blocks_hash.clone(), record);
                }
            }
        }
        Ok(())
    }

    /// Render one learner; `None` when the grade filters exclude them
    async fn learner_row(
        &self,
        ctx: &GradeContext,
        layout: &ReportLayout,
        filter: &ReportFilter,
        learner: &EnrolledLearner,
        visible: &HashMap<String, VisibleBlocks>,
    ) -> Result<Option<Vec<String>>> {
        let learner_id = learner.id();
        if !filter.matches_context(ctx, learner_id) {
            return Ok(None);
        }
        let no_grades = HashMap::new();
        let no_scores = HashMap::new();
        let persisted = ctx.subsection_grades(learner_id).unwrap_or(&no_grades);
        let scores = ctx.scores(learner_id).unwrap_or(&no_scores);

        let summary = self.courses.summarize(ctx, learner_id).await?;
        let mut units: HashMap<UsageKey, SubsectionScore> = HashMap::new();
        if layout.kind() == ReportKind::Progress {
            for info in ctx.view().subsections() {
                let score = self
                    .courses
                    .subsections()
                    .preview(ctx, learner_id, &info.usage_key, persisted.get(&info.usage_key), Some(scores))
                    .await?;
                units.insert(info.usage_key.clone(), score);
            }
        }

        Ok(Some(layout.row(&RowInput {
            learner,
            summary: &summary,
            course_grade: ctx.course_grade(learner_id).flatten(),
            units: &units,
            scores,
            persisted,
            visible,
        })))
    }

    fn announce(&self, task: &ReportTask, progress: &TaskProgress) {
        self.bus.emit_lossy(GradeEvent::ReportProgress {
            event_transaction_id: task.task_id,
            course_id: task.course_id.clone(),
            report_kind: task.report_kind.clone(),
            attempted: progress.attempted,
            succeeded: progress.succeeded,
            failed: progress.failed,
            skipped: progress.skipped,
            total: progress.total,
            timestamp: time::now(),
        });
    }
}
