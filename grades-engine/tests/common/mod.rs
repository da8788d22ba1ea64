//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use grades_common::db::init_database;
use grades_common::events::{GradeEvent, InboundEvent};
use grades_common::{CourseKey, LearnerId, UsageKey};
use grades_engine::directory::{Enrollment, InMemoryLearnerDirectory, Learner};
use grades_engine::grader::LoggingExternalGrader;
use grades_engine::policy::{AssignmentType, GradingPolicy};
use grades_engine::reports::MemoryReportStore;
use grades_engine::structure::{BlockInfo, CourseStructureView, InMemoryCourseStructure, SubsectionInfo};
use grades_engine::{GradesService, RuntimeSettings, ServiceDeps};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub fn course() -> CourseKey {
    "course-v1:Edu+Grading101+2025".parse().unwrap()
}

pub fn key(block_type: &str, id: &str) -> UsageKey {
    course().make_usage_key(block_type, id).unwrap()
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 10, minute, 0).unwrap()
}

pub fn homework(min_count: u32, drop_count: u32) -> AssignmentType {
    AssignmentType {
        name: "Homework".into(),
        weight: 1.0,
        min_count,
        drop_count,
        short_label: "HW".into(),
        passing_grade: None,
    }
}

pub fn policy(types: Vec<AssignmentType>) -> GradingPolicy {
    GradingPolicy {
        assignment_types: types,
        grade_cutoffs: [("Pass".to_string(), 0.5)].into_iter().collect(),
        passing_cutoff: None,
    }
}

/// Subsection `id` of type `format` holding one 10-point problem `<id>_p`
pub fn subsection(id: &str, format: &str) -> SubsectionInfo {
    SubsectionInfo {
        usage_key: key("sequential", id),
        display_name: id.to_uppercase(),
        format: Some(format.to_string()),
        graded: true,
        weight: None,
        edited_at: at(0),
        blocks: vec![BlockInfo {
            usage_key: key("problem", &format!("{}_p", id)),
            display_name: format!("{} problem", id),
            possible: 10.0,
            weight: None,
        }],
    }
}

pub fn view(policy: GradingPolicy, subsections: Vec<SubsectionInfo>) -> CourseStructureView {
    CourseStructureView {
        course_key: course(),
        content_version: "v1".into(),
        edited_at: at(0),
        course_end: None,
        grading_policy: policy,
        subsections,
    }
}

pub fn learner(id: LearnerId) -> Learner {
    Learner {
        id,
        username: format!("student{}", id),
        email: format!("student{}@example.edu", id),
        external_user_key: None,
        anonymous_ids: vec![format!("anon-{}", id)],
        enrollments: vec![Enrollment {
            course_id: course(),
            mode: if id % 2 == 0 { "audit".into() } else { "verified".into() },
            cohort: None,
            is_active: true,
        }],
    }
}

pub struct Harness {
    pub service: GradesService,
    pub pool: SqlitePool,
    pub structures: Arc<InMemoryCourseStructure>,
    pub reports: Arc<MemoryReportStore>,
    pub events: broadcast::Receiver<GradeEvent>,
    pub dir: TempDir,
}

impl Harness {
    /// File-backed service over `structure` with learners `learners`
    pub async fn start(structure: CourseStructureView, learners: &[LearnerId]) -> Self {
        Self::start_with(structure, learners, fast_settings()).await
    }

    pub async fn start_with(
        structure: CourseStructureView,
        learners: &[LearnerId],
        settings: RuntimeSettings,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_database(&dir.path().join("grades.db")).await.unwrap();

        let structures = Arc::new(InMemoryCourseStructure::new());
        structures.insert(structure).await.unwrap();
        let directory = InMemoryLearnerDirectory::new();
        for id in learners {
            directory.insert(learner(*id)).await;
        }
        let reports = Arc::new(MemoryReportStore::new());

        let service = GradesService::start(ServiceDeps {
            pool: pool.clone(),
            settings,
            structure: structures.clone(),
            directory: Arc::new(directory),
            report_store: reports.clone(),
            grader: Arc::new(LoggingExternalGrader),
            work_dir: dir.path().join("work"),
        });
        let events = service.subscribe();
        Self {
            service,
            pool,
            structures,
            reports,
            events,
            dir,
        }
    }

    /// Handle each event, then wait for the scheduler to drain
    pub async fn feed(&self, events: Vec<InboundEvent>) {
        for event in events {
            self.service.handle(event).await.unwrap();
        }
        self.service.wait_idle().await;
    }

    /// Drain buffered outbound events
    pub fn drain(&mut self) -> Vec<GradeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        recalculate_delay_ms: 0,
        scheduler_backoff_base_ms: 5,
        scheduler_backoff_max_ms: 20,
        ..RuntimeSettings::default()
    }
}

pub fn score(learner_id: LearnerId, block: &str, earned: f64, modified_at: DateTime<Utc>) -> InboundEvent {
    InboundEvent::BlockScorePublished {
        event_transaction_id: None,
        learner_id,
        block_id: key("problem", block),
        raw_earned: earned,
        raw_possible: 10.0,
        weight: None,
        only_if_higher: false,
        modified_at,
        deleted: false,
        grader_response: None,
    }
}

pub fn count(events: &[GradeEvent], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type() == event_type).count()
}
