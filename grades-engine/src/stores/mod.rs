//! SQLite-backed stores
//!
//! Each store owns one concern and a clone of the pool. Operations that must
//! commit together take a `Transaction` instead of going through the pool.

pub mod course_grades;
pub mod failures;
pub mod frozen;
pub mod overrides;
pub mod report_tasks;
pub mod scores;
pub mod subsection_grades;
pub mod visible_blocks;

pub use course_grades::{CourseGradeRow, CourseGradeStore, CourseGradeWrite};
pub use failures::{FailureStore, TaskFailure};
pub use frozen::{FrozenCourse, FrozenGuard};
pub use overrides::{
    HistoryType, OverrideHistoryEntry, OverrideRequest, OverrideStore, SubsectionOverride,
};
pub use report_tasks::{Checkpoint, ReportStatus, ReportTask, ReportTaskStore, TaskProgress};
pub use scores::{BlockScore, ScoreStore, UpsertOutcome};
pub use subsection_grades::{SubsectionGradeRow, SubsectionGradeStore, SubsectionGradeWrite};
pub use visible_blocks::{BlockRecord, VisibleBlocks, VisibleBlocksStore};

use crate::config::RuntimeSettings;
use crate::scheduler::GradeQueue;
use crate::structure::CourseStructure;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Every store over one pool
#[derive(Clone)]
pub struct GradeStores {
    pub pool: SqlitePool,
    pub scores: ScoreStore,
    pub visible_blocks: VisibleBlocksStore,
    pub subsection_grades: SubsectionGradeStore,
    pub course_grades: CourseGradeStore,
    pub overrides: OverrideStore,
    pub frozen: FrozenGuard,
    pub failures: FailureStore,
    pub report_tasks: ReportTaskStore,
    pub max_lock_wait_ms: u64,
}

impl GradeStores {
    pub fn new(
        pool: SqlitePool,
        settings: &RuntimeSettings,
        structure: Arc<dyn CourseStructure>,
    ) -> Self {
        let frozen = FrozenGuard::new(pool.clone(), structure, settings.grades_freeze_after_days);
        Self {
            scores: ScoreStore::new(pool.clone(), settings.database_max_lock_wait_ms),
            visible_blocks: VisibleBlocksStore::new(pool.clone()),
            subsection_grades: SubsectionGradeStore::new(pool.clone()),
            course_grades: CourseGradeStore::new(pool.clone()),
            overrides: OverrideStore::new(
                pool.clone(),
                frozen.clone(),
                settings.override_history_limit,
                settings.database_max_lock_wait_ms,
            ),
            frozen,
            failures: FailureStore::new(pool.clone()),
            report_tasks: ReportTaskStore::new(pool.clone()),
            max_lock_wait_ms: settings.database_max_lock_wait_ms,
            pool,
        }
    }

    /// Route override recomputes to a scheduler queue
    pub fn with_queue(mut self, queue: GradeQueue) -> Self {
        self.overrides = self.overrides.with_queue(queue);
        self
    }
}
