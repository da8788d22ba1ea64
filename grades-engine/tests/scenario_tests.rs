//! End-to-end grading scenarios over a file-backed database

mod common;

use chrono::Duration;
use common::*;
use grades_common::db::init_database;
use grades_common::events::{
    EventBus, InboundEvent, OverrideFeature, OverrideFields, ScoreSource, WeightedScoreChanged,
};
use grades_engine::engine::{CourseGradeEngine, SubsectionGradeEngine};
use grades_engine::scheduler::{GradeScheduler, GradeWork, SchedulerDeps};
use grades_engine::stores::{GradeStores, OverrideRequest};
use grades_engine::structure::{CourseStructure, InMemoryCourseStructure};
use grades_engine::{HandleOutcome, RuntimeSettings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn two_homeworks() -> grades_engine::structure::CourseStructureView {
    view(
        policy(vec![homework(2, 0)]),
        vec![subsection("hw1", "Homework"), subsection("hw2", "Homework")],
    )
}

#[tokio::test]
async fn test_simple_pass() {
    let h = Harness::start(two_homeworks(), &[1]).await;
    h.feed(vec![score(1, "hw1_p", 8.0, at(1)), score(1, "hw2_p", 2.0, at(2))])
        .await;

    let row = h
        .service
        .stores()
        .course_grades
        .get(1, &course())
        .await
        .unwrap()
        .unwrap();
    assert!((row.percent_grade - 0.5).abs() < 1e-9);
    assert!(row.passed);
    assert_eq!(row.letter_grade.as_deref(), Some("Pass"));
    assert_eq!(row.passed_at, Some(at(2)));
}

#[tokio::test]
async fn test_drop_lowest() {
    let structure = view(
        policy(vec![homework(3, 1)]),
        vec![
            subsection("hw1", "Homework"),
            subsection("hw2", "Homework"),
            subsection("hw3", "Homework"),
        ],
    );
    let h = Harness::start(structure, &[1]).await;
    h.feed(vec![
        score(1, "hw1_p", 10.0, at(1)),
        score(1, "hw2_p", 0.0, at(2)),
        score(1, "hw3_p", 5.0, at(3)),
    ])
    .await;

    let grade = h
        .service
        .reader()
        .get_course_grade(1, &course())
        .await
        .unwrap()
        .unwrap();
    assert!((grade.percent - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_override_wins_until_removed() {
    let h = Harness::start(two_homeworks(), &[1]).await;
    h.feed(vec![score(1, "hw1_p", 2.0, at(1))]).await;
    let stores = h.service.stores();
    let grade = stores
        .subsection_grades
        .get(1, &key("sequential", "hw1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((grade.earned_graded, grade.possible_graded), (2.0, 10.0));

    h.service
        .upsert_override(
            grade.id,
            &OverrideRequest {
                fields: OverrideFields {
                    earned_graded: Some(9.0),
                    ..Default::default()
                },
                reason_code: "regrade".into(),
                feature: OverrideFeature::Gradebook,
                actor_id: Some(42),
                comment: Some("rubric fix".into()),
            },
        )
        .await
        .unwrap();
    h.service.wait_idle().await;

    let overridden = stores.subsection_grades.get_by_id(grade.id).await.unwrap().unwrap();
    assert_eq!((overridden.earned_graded, overridden.possible_graded), (9.0, 10.0));
    assert!(overridden.overridden);
    let course_row = stores.course_grades.get(1, &course()).await.unwrap().unwrap();
    assert!((course_row.percent_grade - 0.45).abs() < 1e-9);

    h.feed(vec![score(1, "hw1_p", 10.0, at(5))]).await;
    let still = stores.subsection_grades.get_by_id(grade.id).await.unwrap().unwrap();
    assert_eq!(still.earned_graded, 9.0);
    assert_eq!(still.earned_all, 10.0);

    h.service.delete_override(grade.id, Some(42)).await.unwrap();
    h.service.wait_idle().await;
    let restored = stores.subsection_grades.get_by_id(grade.id).await.unwrap().unwrap();
    assert_eq!(restored.earned_graded, 10.0);
    assert!(!restored.overridden);
}

#[tokio::test]
async fn test_only_if_higher_drop_is_silent() {
    let mut h = Harness::start(two_homeworks(), &[1]).await;
    let attempt = |earned: f64, minute: u32| InboundEvent::BlockScorePublished {
        event_transaction_id: None,
        learner_id: 1,
        block_id: key("problem", "hw1_p"),
        raw_earned: earned,
        raw_possible: 5.0,
        weight: None,
        only_if_higher: true,
        modified_at: at(minute),
        deleted: false,
        grader_response: None,
    };
    h.feed(vec![attempt(3.0, 1)]).await;
    h.drain();

    let outcome = h.service.handle(attempt(2.0, 2)).await.unwrap();
    assert!(matches!(outcome, HandleOutcome::Ignored { .. }));
    h.service.wait_idle().await;
    assert!(h.drain().is_empty());

    let stored = h
        .service
        .stores()
        .scores
        .get(1, &key("problem", "hw1_p"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((stored.raw_earned, stored.raw_possible), (3.0, 5.0));
    assert_eq!(stored.modified_at, at(1));
}

#[tokio::test]
async fn test_proctoring_rejection_then_verification() {
    let h = Harness::start(two_homeworks(), &[1]).await;
    h.feed(vec![score(1, "hw1_p", 7.0, at(1))]).await;

    h.feed(vec![InboundEvent::ExamAttemptRejected {
        event_transaction_id: None,
        learner_id: 1,
        subsection_id: key("sequential", "hw1"),
    }])
    .await;
    let stores = h.service.stores();
    let rejected = stores
        .subsection_grades
        .get(1, &key("sequential", "hw1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((rejected.earned_all, rejected.earned_graded), (0.0, 0.0));
    let active = stores.overrides.active(rejected.id).await.unwrap().unwrap();
    assert_eq!(active.feature, OverrideFeature::Proctoring);

    h.feed(vec![InboundEvent::ExamAttemptVerified {
        event_transaction_id: None,
        learner_id: 1,
        subsection_id: key("sequential", "hw1"),
    }])
    .await;
    let verified = stores.subsection_grades.get_by_id(rejected.id).await.unwrap().unwrap();
    assert_eq!((verified.earned_all, verified.earned_graded), (7.0, 7.0));
    assert!(stores.overrides.active(rejected.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_read_is_retried_until_the_row_lands() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("grades.db")).await.unwrap();
    let structures = InMemoryCourseStructure::new();
    structures.insert(two_homeworks()).await.unwrap();
    let structure: Arc<dyn CourseStructure> = Arc::new(structures);

    let settings = RuntimeSettings {
        recalculate_delay_ms: 0,
        scheduler_max_attempts: 5,
        scheduler_backoff_base_ms: 10,
        scheduler_backoff_max_ms: 40,
        ..RuntimeSettings::default()
    };
    let bus = EventBus::new(64);
    let stores = GradeStores::new(pool.clone(), &settings, structure.clone());
    let subsections = SubsectionGradeEngine::new(pool.clone(), bus.clone(), 1000);
    let courses = CourseGradeEngine::new(pool, subsections, stores.frozen.clone(), bus.clone(), 1000);
    let (scheduler, queue) = GradeScheduler::start(
        SchedulerDeps {
            structure,
            stores: stores.clone(),
            courses,
            bus,
        },
        settings,
        CancellationToken::new(),
    );

    let t = at(30);
    let change = |earned: f64, modified_at| WeightedScoreChanged {
        event_transaction_id: Uuid::new_v4(),
        learner_id: 1,
        course_id: course(),
        block_id: key("problem", "hw1_p"),
        weighted_earned: earned,
        weighted_possible: 10.0,
        raw_earned: earned,
        raw_possible: 10.0,
        weight: None,
        source: ScoreSource::BlockState,
        modified_at,
        only_if_higher: false,
        deleted: false,
        grader_response: None,
    };
    stores.scores.upsert(&change(3.0, t - Duration::milliseconds(5))).await.unwrap();

    let event = change(9.0, t);
    queue.enqueue(GradeWork::ScoreChanged(event.clone())).unwrap();
    let late_writer = {
        let scores = stores.scores.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            scores.upsert(&event).await.unwrap();
        })
    };
    late_writer.await.unwrap();
    scheduler.wait_idle().await;

    let grade = stores
        .subsection_grades
        .get(1, &key("sequential", "hw1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(grade.earned_graded, 9.0);
    assert!(grade.modified_at >= t);
    assert!(stores.failures.recent(10).await.unwrap().is_empty());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_submission_scores_resolve_anonymous_handles() {
    let h = Harness::start(two_homeworks(), &[1, 2]).await;
    h.feed(vec![InboundEvent::SubmissionScoreSet {
        event_transaction_id: None,
        anonymous_user_id: "anon-2".into(),
        course_id: course(),
        item_id: key("problem", "hw2_p"),
        points_earned: 6.0,
        points_possible: 10.0,
        modified_at: at(4),
    }])
    .await;
    let grade = h
        .service
        .stores()
        .subsection_grades
        .get(2, &key("sequential", "hw2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(grade.earned_graded, 6.0);

    h.feed(vec![InboundEvent::SubmissionScoreReset {
        event_transaction_id: None,
        anonymous_user_id: "anon-2".into(),
        course_id: course(),
        item_id: key("problem", "hw2_p"),
        modified_at: at(5),
    }])
    .await;
    let reset = h
        .service
        .stores()
        .subsection_grades
        .get(2, &key("sequential", "hw2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((reset.earned_graded, reset.possible_graded), (0.0, 10.0));
}

#[tokio::test]
async fn test_block_score_after_submission_is_source_mismatch() {
    let h = Harness::start(two_homeworks(), &[1]).await;
    h.feed(vec![InboundEvent::SubmissionScoreSet {
        event_transaction_id: None,
        anonymous_user_id: "anon-1".into(),
        course_id: course(),
        item_id: key("problem", "hw1_p"),
        points_earned: 4.0,
        points_possible: 10.0,
        modified_at: at(1),
    }])
    .await;
    let err = h.service.handle(score(1, "hw1_p", 9.0, at(2))).await.unwrap_err();
    assert_eq!(err.code(), "source_mismatch");
}
