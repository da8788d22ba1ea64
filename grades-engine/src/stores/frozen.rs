//! Frozen course guard
//!
//! A course is frozen when it has an explicit `frozen_courses` row, or when
//! `grades_freeze_after_days` is set and that many days have passed since
//! the course end date.

use crate::error::{GradesError, Result};
use crate::structure::CourseStructure;
use chrono::{DateTime, Duration, Utc};
use grades_common::time;
use grades_common::CourseKey;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrozenCourse {
    pub course_id: CourseKey,
    pub frozen_at: DateTime<Utc>,
    pub frozen_by: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct FrozenGuard {
    pool: SqlitePool,
    structure: Arc<dyn CourseStructure>,
    freeze_after_days: Option<u32>,
}

impl FrozenGuard {
    pub fn new(
        pool: SqlitePool,
        structure: Arc<dyn CourseStructure>,
        freeze_after_days: Option<u32>,
    ) -> Self {
        Self {
            pool,
            structure,
            freeze_after_days,
        }
    }

    pub async fn is_frozen(&self, course: &CourseKey) -> Result<bool> {
        if self.explicit(course).await?.is_some() {
            return Ok(true);
        }
        let Some(days) = self.freeze_after_days else {
            return Ok(false);
        };
        // Without a snapshot only explicit freezes apply
        let course_end = match self.structure.snapshot(course).await {
            Ok(view) => view.course_end,
            Err(e) => {
                debug!(course = %course, error = %e, "No structure for automatic freeze check");
                None
            }
        };
        Ok(course_end.is_some_and(|end| time::now() >= end + Duration::days(i64::from(days))))
    }

    /// Fail with `GradesFrozen` when the course is frozen
    pub async fn ensure_not_frozen(&self, course: &CourseKey) -> Result<()> {
        if self.is_frozen(course).await? {
            Err(GradesError::GradesFrozen(course.normalized()))
        } else {
            Ok(())
        }
    }

    pub async fn explicit(&self, course: &CourseKey) -> Result<Option<FrozenCourse>> {
        let row = sqlx::query(
            "SELECT course_id, frozen_at, frozen_by, reason FROM frozen_courses WHERE course_id = ?",
        )
        .bind(course.normalized().to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let course_id: String = row.try_get("course_id")?;
                let frozen_at: String = row.try_get("frozen_at")?;
                Ok(Some(FrozenCourse {
                    course_id: course_id.parse()?,
                    frozen_at: time::from_db(&frozen_at)?,
                    frozen_by: row.try_get("frozen_by")?,
                    reason: row.try_get("reason")?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Freeze a course; freezing twice keeps the original record
    pub async fn freeze(
        &self,
        course: &CourseKey,
        actor_id: Option<i64>,
        reason: Option<&str>,
    ) -> Result<FrozenCourse> {
        let course = course.normalized();
        sqlx::query(
            "INSERT OR IGNORE INTO frozen_courses (course_id, frozen_at, frozen_by, reason) VALUES (?, ?, ?, ?)",
        )
        .bind(course.to_string())
        .bind(time::to_db(&time::now()))
        .bind(actor_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        info!(course = %course, actor_id, "Course grades frozen");

        self.explicit(&course).await?.ok_or_else(|| {
            GradesError::FatalStoreError(format!("Freeze of {} did not persist", course))
        })
    }

    /// Remove an explicit freeze; returns whether one existed
    pub async fn unfreeze(&self, course: &CourseKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM frozen_courses WHERE course_id = ?")
            .bind(course.normalized().to_string())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(course = %course, "Course grades unfrozen");
        }
        Ok(removed)
    }
}
