//! Grades service facade
//!
//! Owns the scheduler and every component, routes inbound events, and
//! exposes the administrative operations (overrides, resets, freezes).

use crate::config::RuntimeSettings;
use crate::context::GradeContext;
use crate::directory::LearnerDirectory;
use crate::engine::{CourseGradeEngine, SubsectionGradeEngine};
use crate::error::{GradesError, Result};
use crate::grader::ExternalGrader;
use crate::ingress::{BlockScoreInput, ScoreIngress};
use crate::read_api::GradeReader;
use crate::reports::{ReportGenerator, ReportStore};
use crate::scheduler::{GradeQueue, GradeScheduler, GradeWork, SchedulerDeps};
use crate::stores::{
    CourseGradeStore, FrozenCourse, GradeStores, OverrideRequest, OverrideStore, SubsectionGradeRow,
    SubsectionGradeStore, SubsectionOverride, UpsertOutcome,
};
use crate::structure::CourseStructure;
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{
    EventBus, GradeEvent, InboundEvent, OverrideFeature, OverrideFields, WeightedScoreChanged,
};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reason code on overrides synthesized from a rejected exam attempt
pub const PROCTORING_REASON: &str = "proctoring_rejected";

/// What happened to an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandleOutcome {
    /// Recompute work was queued
    Scheduled,
    /// Nothing to do
    Ignored { reason: String },
    /// Passed to a collaborator
    Delegated,
}

impl HandleOutcome {
    fn ignored(reason: &str) -> Self {
        HandleOutcome::Ignored {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOverrideItem {
    pub learner_id: LearnerId,
    pub subsection_id: UsageKey,
    pub fields: OverrideFields,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOverrideResult {
    pub learner_id: LearnerId,
    pub subsection_id: UsageKey,
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub subsection_grades_deleted: u64,
    pub overrides_closed: usize,
    pub course_grade_deleted: bool,
}

/// Collaborators the service is built from
pub struct ServiceDeps {
    pub pool: SqlitePool,
    pub settings: RuntimeSettings,
    pub structure: Arc<dyn CourseStructure>,
    pub directory: Arc<dyn LearnerDirectory>,
    pub report_store: Arc<dyn ReportStore>,
    pub grader: Arc<dyn ExternalGrader>,
    /// Scratch space for reports in progress
    pub work_dir: PathBuf,
}

pub struct GradesService {
    structure: Arc<dyn CourseStructure>,
    stores: GradeStores,
    ingress: ScoreIngress,
    courses: CourseGradeEngine,
    reader: GradeReader,
    reports: ReportGenerator,
    grader: Arc<dyn ExternalGrader>,
    scheduler: GradeScheduler,
    queue: GradeQueue,
    bus: EventBus,
    cancel: CancellationToken,
}

impl GradesService {
    /// Wire every component and start the scheduler
    pub fn start(deps: ServiceDeps) -> Self {
        let settings = deps.settings;
        let bus = EventBus::new(settings.event_bus_capacity);
        let cancel = CancellationToken::new();
        let max_lock_wait_ms = settings.database_max_lock_wait_ms;

        let stores = GradeStores::new(deps.pool.clone(), &settings, deps.structure.clone());
        let subsections = SubsectionGradeEngine::new(deps.pool.clone(), bus.clone(), max_lock_wait_ms);
        let courses = CourseGradeEngine::new(
            deps.pool,
            subsections,
            stores.frozen.clone(),
            bus.clone(),
            max_lock_wait_ms,
        );

        let (scheduler, queue) = GradeScheduler::start(
            SchedulerDeps {
                structure: deps.structure.clone(),
                stores: stores.clone(),
                courses: courses.clone(),
                bus: bus.clone(),
            },
            settings.clone(),
            cancel.child_token(),
        );
        let stores = stores.with_queue(queue.clone());

        let reader = GradeReader::new(
            deps.structure.clone(),
            deps.directory.clone(),
            stores.clone(),
            courses.clone(),
            settings.report_batch_size,
        );
        let reports = ReportGenerator::new(
            deps.structure.clone(),
            deps.directory.clone(),
            stores.clone(),
            courses.clone(),
            deps.report_store,
            bus.clone(),
            deps.work_dir,
            settings.report_batch_size,
        );

        info!("Grades service started");
        Self {
            ingress: ScoreIngress::new(deps.structure.clone(), deps.directory),
            structure: deps.structure,
            stores,
            courses,
            reader,
            reports,
            grader: deps.grader,
            scheduler,
            queue,
            bus,
            cancel,
        }
    }

    pub fn reader(&self) -> &GradeReader {
        &self.reader
    }

    pub fn reports(&self) -> &ReportGenerator {
        &self.reports
    }

    pub fn stores(&self) -> &GradeStores {
        &self.stores
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GradeEvent> {
        self.bus.subscribe()
    }

    /// Token cancelled by [`GradesService::shutdown`]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Route one inbound event
    pub async fn handle(&self, mut event: InboundEvent) -> Result<HandleOutcome> {
        let txn = event.ensure_transaction_id();
        debug!(event_transaction_id = %txn, event_type = event.event_type(), "Handling inbound event");

        match event {
            InboundEvent::BlockScorePublished {
                learner_id,
                block_id,
                raw_earned,
                raw_possible,
                weight,
                only_if_higher,
                modified_at,
                deleted,
                grader_response,
                ..
            } => {
                let input = BlockScoreInput {
                    learner_id,
                    block_id,
                    raw_earned,
                    raw_possible,
                    weight,
                    only_if_higher,
                    modified_at,
                    deleted,
                    grader_response,
                };
                let change = self.ingress.from_block_score(input, txn).await?;
                self.ingest(change).await
            }
            InboundEvent::SubmissionScoreSet {
                anonymous_user_id,
                course_id,
                item_id,
                points_earned,
                points_possible,
                modified_at,
                ..
            } => {
                let change = self
                    .ingress
                    .from_submission_set(
                        &anonymous_user_id,
                        &course_id,
                        &item_id,
                        points_earned,
                        points_possible,
                        modified_at,
                        txn,
                    )
                    .await?;
                match change {
                    Some(change) => self.ingest(change).await,
                    None => Ok(HandleOutcome::ignored("submission dropped")),
                }
            }
            InboundEvent::SubmissionScoreReset {
                anonymous_user_id,
                course_id,
                item_id,
                modified_at,
                ..
            } => {
                let change = self
                    .ingress
                    .from_submission_reset(&anonymous_user_id, &course_id, &item_id, modified_at, txn)
                    .await?;
                match change {
                    Some(change) => self.ingest(change).await,
                    None => Ok(HandleOutcome::ignored("submission dropped")),
                }
            }
            InboundEvent::OverrideRequested {
                subsection_grade_id,
                fields,
                reason_code,
                feature,
                actor_id,
                comment,
                ..
            } => {
                let request = OverrideRequest {
                    fields,
                    reason_code,
                    feature,
                    actor_id,
                    comment,
                };
                self.stores.overrides.upsert(subsection_grade_id, &request, txn).await?;
                Ok(HandleOutcome::Scheduled)
            }
            InboundEvent::EnrollmentTrackChanged {
                learner_id,
                course_id,
                ..
            } => self.force_recompute(learner_id, course_id, "enrollment_track_changed", txn),
            InboundEvent::CohortMembershipChanged {
                learner_id,
                course_id,
                ..
            } => self.force_recompute(learner_id, course_id, "cohort_membership_changed", txn),
            InboundEvent::ExamAttemptRejected {
                learner_id,
                subsection_id,
                ..
            } => {
                let grade = self.ensure_grade(learner_id, &subsection_id, txn).await?;
                let request = OverrideRequest {
                    fields: OverrideFields {
                        earned_all: Some(0.0),
                        earned_graded: Some(0.0),
                        ..Default::default()
                    },
                    reason_code: PROCTORING_REASON.to_string(),
                    feature: OverrideFeature::Proctoring,
                    actor_id: None,
                    comment: None,
                };
                self.stores.overrides.upsert(grade.id, &request, txn).await?;
                info!(learner_id, subsection = %subsection_id, "Exam attempt rejected, grade overridden");
                Ok(HandleOutcome::Scheduled)
            }
            InboundEvent::ExamAttemptVerified {
                learner_id,
                subsection_id,
                ..
            } => {
                let Some(grade) = self.stores.subsection_grades.get(learner_id, &subsection_id).await? else {
                    return Ok(HandleOutcome::ignored("no subsection grade"));
                };
                match self.stores.overrides.active(grade.id).await? {
                    Some(active) if active.feature == OverrideFeature::Proctoring => {
                        self.stores.overrides.delete(grade.id, None, txn).await?;
                        info!(learner_id, subsection = %subsection_id, "Exam attempt verified, override removed");
                        Ok(HandleOutcome::Scheduled)
                    }
                    _ => Ok(HandleOutcome::ignored("no proctoring override")),
                }
            }
            InboundEvent::ExternalGraderScoreSubmitted {
                submission_id,
                queue_key,
                queue_name,
                score_msg,
                ..
            } => {
                self.grader
                    .score_submitted(&submission_id, &queue_key, &queue_name, &score_msg)
                    .await?;
                Ok(HandleOutcome::Delegated)
            }
        }
    }

    /// Write a normalized score and queue the recompute
    ///
    /// In a frozen course the score is stored but no recompute is queued;
    /// the caller gets `GradesFrozen`.
    pub async fn ingest(&self, change: WeightedScoreChanged) -> Result<HandleOutcome> {
        match self.stores.scores.upsert(&change).await? {
            UpsertOutcome::Written(_) => {
                self.stores.frozen.ensure_not_frozen(&change.course_id).await?;
                self.queue.enqueue(GradeWork::ScoreChanged(change))?;
                Ok(HandleOutcome::Scheduled)
            }
            UpsertOutcome::NotHigher => Ok(HandleOutcome::ignored("score not higher")),
            UpsertOutcome::Superseded(_) => Ok(HandleOutcome::ignored("score superseded")),
        }
    }

    fn force_recompute(
        &self,
        learner_id: LearnerId,
        course_id: CourseKey,
        reason: &str,
        txn: Uuid,
    ) -> Result<HandleOutcome> {
        self.queue.enqueue(GradeWork::CourseRecompute {
            event_transaction_id: txn,
            learner_id,
            course_id,
            reason: reason.to_string(),
            requested_at: time::now(),
        })?;
        Ok(HandleOutcome::Scheduled)
    }

    /// Persisted subsection grade, computed from current scores if absent
    pub async fn ensure_grade(
        &self,
        learner_id: LearnerId,
        subsection_id: &UsageKey,
        txn: Uuid,
    ) -> Result<SubsectionGradeRow> {
        let course = subsection_id.course_key();
        self.stores.frozen.ensure_not_frozen(course).await?;
        let ctx = GradeContext::load(self.structure.as_ref(), course).await?;
        self.courses
            .subsections()
            .ensure(&ctx, learner_id, subsection_id, txn)
            .await
    }

    pub async fn upsert_override(
        &self,
        grade_id: i64,
        request: &OverrideRequest,
    ) -> Result<SubsectionOverride> {
        self.stores.overrides.upsert(grade_id, request, Uuid::new_v4()).await
    }

    pub async fn delete_override(
        &self,
        grade_id: i64,
        actor_id: Option<i64>,
    ) -> Result<Option<SubsectionOverride>> {
        self.stores.overrides.delete(grade_id, actor_id, Uuid::new_v4()).await
    }

    /// Apply gradebook overrides item by item
    ///
    /// Refused entirely for a frozen course; otherwise a failing item is
    /// reported and the rest still apply.
    pub async fn bulk_override(
        &self,
        course: &CourseKey,
        actor_id: Option<i64>,
        items: Vec<BulkOverrideItem>,
    ) -> Result<Vec<BulkOverrideResult>> {
        let course = course.normalized();
        self.stores.frozen.ensure_not_frozen(&course).await?;
        let txn = Uuid::new_v4();

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let outcome = self.bulk_override_one(&course, actor_id, &item, txn).await;
            if let Err(e) = &outcome {
                warn!(
                    learner_id = item.learner_id,
                    subsection = %item.subsection_id,
                    code = e.code(),
                    error = %e,
                    "Bulk override item failed"
                );
            }
            results.push(BulkOverrideResult {
                learner_id: item.learner_id,
                subsection_id: item.subsection_id,
                success: outcome.is_ok(),
                reason: outcome.err().map(|e| e.to_string()),
            });
        }
        info!(
            course = %course,
            items = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            "Bulk override applied"
        );
        Ok(results)
    }

    async fn bulk_override_one(
        &self,
        course: &CourseKey,
        actor_id: Option<i64>,
        item: &BulkOverrideItem,
        txn: Uuid,
    ) -> Result<SubsectionOverride> {
        if &item.subsection_id.course_key().normalized() != course {
            return Err(GradesError::InvalidOverride(format!(
                "Subsection {} is not in course {}",
                item.subsection_id, course
            )));
        }
        let grade = self.ensure_grade(item.learner_id, &item.subsection_id, txn).await?;
        let request = OverrideRequest {
            fields: item.fields,
            reason_code: "bulk_gradebook".to_string(),
            feature: OverrideFeature::Gradebook,
            actor_id,
            comment: item.comment.clone(),
        };
        self.stores.overrides.upsert(grade.id, &request, txn).await
    }

    /// Delete a learner's subsection and course grades in a course
    ///
    /// Active overrides are closed with `-` history rows first. Scores are
    /// kept; the next score event rebuilds the grades.
    pub async fn reset_learner_grades(
        &self,
        learner_id: LearnerId,
        course: &CourseKey,
        actor_id: Option<i64>,
    ) -> Result<ResetSummary> {
        let course = course.normalized();
        self.stores.frozen.ensure_not_frozen(&course).await?;
        let summary = retry_on_lock("learner grade reset", self.stores.max_lock_wait_ms, || {
            self.reset_once(learner_id, &course, actor_id, time::now())
        })
        .await?;
        info!(
            learner_id,
            course = %course,
            subsections = summary.subsection_grades_deleted,
            overrides = summary.overrides_closed,
            "Learner grades reset"
        );
        Ok(summary)
    }

    async fn reset_once(
        &self,
        learner_id: LearnerId,
        course: &CourseKey,
        actor_id: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<ResetSummary> {
        let mut tx = self.stores.pool.begin().await?;
        let overrides_closed = OverrideStore::record_reset_in_tx(&mut tx, learner_id, course, actor_id, at).await?;
        let subsection_grades_deleted =
            SubsectionGradeStore::delete_for_learner_in_tx(&mut tx, learner_id, course).await?;
        let course_grade_deleted = CourseGradeStore::delete_in_tx(&mut tx, learner_id, course).await?;
        tx.commit().await?;
        Ok(ResetSummary {
            subsection_grades_deleted,
            overrides_closed,
            course_grade_deleted,
        })
    }

    pub async fn freeze_course(
        &self,
        course: &CourseKey,
        actor_id: Option<i64>,
        reason: Option<&str>,
    ) -> Result<FrozenCourse> {
        self.stores.frozen.freeze(course, actor_id, reason).await
    }

    pub async fn unfreeze_course(&self, course: &CourseKey) -> Result<bool> {
        self.stores.frozen.unfreeze(course).await
    }

    /// Resolve once the scheduler has nothing queued or running
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Cancel outstanding work and stop the scheduler
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.shutdown().await;
        info!("Grades service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::test_support::directory_with;
    use crate::reports::MemoryReportStore;
    use crate::stores::HistoryType;
    use crate::structure::test_support::{course, key, two_homeworks};
    use crate::structure::InMemoryCourseStructure;
    use async_trait::async_trait;
    use grades_common::db::init_memory_database;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingGrader {
        submissions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExternalGrader for RecordingGrader {
        async fn score_submitted(
            &self,
            submission_id: &str,
            _queue_key: &str,
            _queue_name: &str,
            _score_msg: &serde_json::Value,
        ) -> Result<()> {
            self.submissions.lock().await.push(submission_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        service: GradesService,
        grader: Arc<RecordingGrader>,
        _work: TempDir,
    }

    async fn fixture() -> Fixture {
        let pool = init_memory_database().await.unwrap();
        let structure = InMemoryCourseStructure::new();
        structure.insert(two_homeworks()).await.unwrap();
        let grader = Arc::new(RecordingGrader::default());
        let work = TempDir::new().unwrap();
        let service = GradesService::start(ServiceDeps {
            pool,
            settings: RuntimeSettings {
                recalculate_delay_ms: 0,
                ..RuntimeSettings::default()
            },
            structure: Arc::new(structure),
            directory: Arc::new(directory_with(&course(), &[1, 2]).await),
            report_store: Arc::new(MemoryReportStore::new()),
            grader: grader.clone(),
            work_dir: work.path().to_path_buf(),
        });
        Fixture {
            service,
            grader,
            _work: work,
        }
    }

    fn block_score(learner_id: LearnerId, block: &str, earned: f64, at: DateTime<Utc>) -> InboundEvent {
        InboundEvent::BlockScorePublished {
            event_transaction_id: None,
            learner_id,
            block_id: key("problem", block),
            raw_earned: earned,
            raw_possible: 10.0,
            weight: None,
            only_if_higher: false,
            modified_at: at,
            deleted: false,
            grader_response: None,
        }
    }

    async fn graded(service: &GradesService, learner_id: LearnerId, subsection: &str) -> SubsectionGradeRow {
        service
            .stores()
            .subsection_grades
            .get(learner_id, &key("sequential", subsection))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_block_score_schedules_recompute() {
        let f = fixture().await;
        let outcome = f.service.handle(block_score(1, "p1", 6.0, time::now())).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Scheduled);
        f.service.wait_idle().await;

        assert_eq!(graded(&f.service, 1, "hw1").await.earned_graded, 6.0);
        let course_grade = f.service.stores().course_grades.get(1, &course()).await.unwrap().unwrap();
        assert_eq!(course_grade.percent_grade, 0.3);
        f.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_older_score_is_ignored() {
        let f = fixture().await;
        let t = time::now();
        f.service.handle(block_score(1, "p1", 6.0, t)).await.unwrap();
        let outcome = f
            .service
            .handle(block_score(1, "p1", 9.0, t - chrono::Duration::seconds(5)))
            .await
            .unwrap();
        assert!(matches!(outcome, HandleOutcome::Ignored { .. }));
        f.service.wait_idle().await;
        assert_eq!(graded(&f.service, 1, "hw1").await.earned_graded, 6.0);
    }

    #[tokio::test]
    async fn test_frozen_course_stores_score_but_refuses_recompute() {
        let f = fixture().await;
        f.service.freeze_course(&course(), Some(9), Some("term closed")).await.unwrap();
        let err = f.service.handle(block_score(1, "p1", 6.0, time::now())).await.unwrap_err();
        assert_eq!(err.code(), "grades_frozen");
        f.service.wait_idle().await;

        let score = f.service.stores().scores.get(1, &key("problem", "p1")).await.unwrap();
        assert!(score.is_some());
        assert!(f
            .service
            .stores()
            .subsection_grades
            .get(1, &key("sequential", "hw1"))
            .await
            .unwrap()
            .is_none());

        assert!(f.service.unfreeze_course(&course()).await.unwrap());
        assert!(!f.service.unfreeze_course(&course()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_exam_zeroes_and_verified_restores() {
        let f = fixture().await;
        f.service.handle(block_score(1, "p1", 8.0, time::now())).await.unwrap();
        f.service.wait_idle().await;

        let rejected = InboundEvent::ExamAttemptRejected {
            event_transaction_id: None,
            learner_id: 1,
            subsection_id: key("sequential", "hw1"),
        };
        assert_eq!(f.service.handle(rejected).await.unwrap(), HandleOutcome::Scheduled);
        f.service.wait_idle().await;
        let grade = graded(&f.service, 1, "hw1").await;
        assert_eq!(grade.earned_graded, 0.0);
        assert!(grade.overridden);

        let verified = InboundEvent::ExamAttemptVerified {
            event_transaction_id: None,
            learner_id: 1,
            subsection_id: key("sequential", "hw1"),
        };
        assert_eq!(f.service.handle(verified.clone()).await.unwrap(), HandleOutcome::Scheduled);
        f.service.wait_idle().await;
        let grade = graded(&f.service, 1, "hw1").await;
        assert_eq!(grade.earned_graded, 8.0);
        assert!(!grade.overridden);

        assert!(matches!(
            f.service.handle(verified).await.unwrap(),
            HandleOutcome::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn test_verified_keeps_gradebook_override() {
        let f = fixture().await;
        let grade = f
            .service
            .ensure_grade(1, &key("sequential", "hw1"), Uuid::new_v4())
            .await
            .unwrap();
        f.service
            .upsert_override(
                grade.id,
                &OverrideRequest {
                    fields: OverrideFields {
                        earned_graded: Some(4.0),
                        ..Default::default()
                    },
                    reason_code: "regrade".into(),
                    feature: OverrideFeature::Gradebook,
                    actor_id: Some(7),
                    comment: None,
                },
            )
            .await
            .unwrap();
        f.service.wait_idle().await;

        let verified = InboundEvent::ExamAttemptVerified {
            event_transaction_id: None,
            learner_id: 1,
            subsection_id: key("sequential", "hw1"),
        };
        assert!(matches!(
            f.service.handle(verified).await.unwrap(),
            HandleOutcome::Ignored { .. }
        ));
        assert!(f.service.stores().overrides.active(grade.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bulk_override_reports_each_item() {
        let f = fixture().await;
        let other: UsageKey = "block-v1:Org+C2+R1+type@sequential+block@hw1".parse().unwrap();
        let items = vec![
            BulkOverrideItem {
                learner_id: 1,
                subsection_id: key("sequential", "hw1"),
                fields: OverrideFields {
                    earned_graded: Some(5.0),
                    ..Default::default()
                },
                comment: Some("late work accepted".into()),
            },
            BulkOverrideItem {
                learner_id: 2,
                subsection_id: other,
                fields: OverrideFields {
                    earned_graded: Some(5.0),
                    ..Default::default()
                },
                comment: None,
            },
        ];
        let results = f.service.bulk_override(&course(), Some(3), items).await.unwrap();
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].reason.is_some());

        f.service.wait_idle().await;
        let grade = graded(&f.service, 1, "hw1").await;
        assert_eq!(grade.earned_graded, 5.0);
        let active = f.service.stores().overrides.active(grade.id).await.unwrap().unwrap();
        assert_eq!(active.feature, OverrideFeature::Gradebook);
    }

    #[tokio::test]
    async fn test_bulk_override_refused_when_frozen() {
        let f = fixture().await;
        f.service.freeze_course(&course(), None, None).await.unwrap();
        let err = f.service.bulk_override(&course(), None, Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "grades_frozen");
    }

    #[tokio::test]
    async fn test_reset_closes_overrides_and_deletes_grades() {
        let f = fixture().await;
        f.service.handle(block_score(1, "p1", 8.0, time::now())).await.unwrap();
        f.service.wait_idle().await;
        let grade = graded(&f.service, 1, "hw1").await;
        f.service
            .upsert_override(
                grade.id,
                &OverrideRequest {
                    fields: OverrideFields {
                        earned_graded: Some(2.0),
                        ..Default::default()
                    },
                    reason_code: "regrade".into(),
                    feature: OverrideFeature::SupportTool,
                    actor_id: Some(7),
                    comment: None,
                },
            )
            .await
            .unwrap();
        f.service.wait_idle().await;

        let summary = f.service.reset_learner_grades(1, &course(), Some(7)).await.unwrap();
        assert_eq!(summary.overrides_closed, 1);
        assert_eq!(summary.subsection_grades_deleted, 2);
        assert!(summary.course_grade_deleted);

        assert!(f.service.stores().course_grades.get(1, &course()).await.unwrap().is_none());
        let (active, history) = f
            .service
            .stores()
            .overrides
            .read_with_history(grade.id, None)
            .await
            .unwrap();
        assert!(active.is_none());
        assert!(history.iter().any(|h| h.history_type == HistoryType::Deleted));
        assert!(f.service.stores().scores.get(1, &key("problem", "p1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_membership_change_forces_course_recompute() {
        let f = fixture().await;
        let event = InboundEvent::CohortMembershipChanged {
            event_transaction_id: None,
            learner_id: 2,
            course_id: course(),
        };
        assert_eq!(f.service.handle(event).await.unwrap(), HandleOutcome::Scheduled);
        f.service.wait_idle().await;
        let row = f.service.stores().course_grades.get(2, &course()).await.unwrap().unwrap();
        assert_eq!(row.percent_grade, 0.0);
    }

    #[tokio::test]
    async fn test_external_grader_is_delegated() {
        let f = fixture().await;
        let event = InboundEvent::ExternalGraderScoreSubmitted {
            event_transaction_id: None,
            submission_id: "sub-1".into(),
            queue_key: "qk".into(),
            queue_name: "python".into(),
            score_msg: serde_json::json!({"correct": true}),
        };
        assert_eq!(f.service.handle(event).await.unwrap(), HandleOutcome::Delegated);
        assert_eq!(*f.grader.submissions.lock().await, vec!["sub-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_anonymous_learner_is_dropped() {
        let f = fixture().await;
        let event = InboundEvent::SubmissionScoreSet {
            event_transaction_id: None,
            anonymous_user_id: "nobody".into(),
            course_id: course(),
            item_id: key("problem", "p1"),
            points_earned: 1.0,
            points_possible: 2.0,
            modified_at: time::now(),
        };
        assert!(matches!(
            f.service.handle(event).await.unwrap(),
            HandleOutcome::Ignored { .. }
        ));
    }
}
