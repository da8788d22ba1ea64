//! Report job bookkeeping
//!
//! A task row records progress counters and the last learner written, so a
//! cancelled or crashed job can resume after that learner.

use crate::error::{GradesError, Result};
use chrono::{DateTime, Utc};
use grades_common::time;
use grades_common::{CourseKey, LearnerId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Running,
    Cancelled,
    Succeeded,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Running => "running",
            ReportStatus::Cancelled => "cancelled",
            ReportStatus::Succeeded => "succeeded",
            ReportStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Succeeded | ReportStatus::Failed)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = GradesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ReportStatus::Running),
            "cancelled" => Ok(ReportStatus::Cancelled),
            "succeeded" => Ok(ReportStatus::Succeeded),
            "failed" => Ok(ReportStatus::Failed),
            other => Err(GradesError::Common(grades_common::Error::Internal(format!(
                "Unknown report status '{}'",
                other
            )))),
        }
    }
}

/// Per-job counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total: u64,
}

/// Where a resumed report picks up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub last_learner_id: Option<LearnerId>,
    /// Flushed length of the report file
    pub report_bytes: u64,
    /// Flushed length of the error file
    pub error_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportTask {
    pub task_id: Uuid,
    pub course_id: CourseKey,
    pub report_kind: String,
    pub status: ReportStatus,
    pub filters: serde_json::Value,
    pub progress: TaskProgress,
    pub checkpoint: Checkpoint,
    pub work_dir: PathBuf,
    pub report_location: Option<String>,
    pub error_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReportTaskStore {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "task_id, course_id, report_kind, status, filters, attempted, \
     succeeded, failed, skipped, total, last_learner_id, report_bytes, error_bytes, work_dir, \
     report_location, error_location, created_at, updated_at";

impl ReportTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        course: &CourseKey,
        report_kind: &str,
        filters: &serde_json::Value,
        total: u64,
        work_dir: &std::path::Path,
    ) -> Result<ReportTask> {
        let task_id = Uuid::new_v4();
        let now = time::to_db(&time::now());
        sqlx::query(
            r#"
            INSERT INTO report_tasks (
                task_id, course_id, report_kind, status, filters, total, work_dir, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id.to_string())
        .bind(course.normalized().to_string())
        .bind(report_kind)
        .bind(ReportStatus::Running.as_str())
        .bind(filters.to_string())
        .bind(total as i64)
        .bind(work_dir.to_string_lossy().to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(task_id).await?.ok_or_else(|| {
            GradesError::FatalStoreError(format!("Report task {} did not persist", task_id))
        })
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<ReportTask>> {
        sqlx::query(&format!(
            "SELECT {} FROM report_tasks WHERE task_id = ?",
            SELECT_COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_task(&row))
        .transpose()
    }

    /// Persist counters and the checkpoint after a batch
    pub async fn checkpoint(
        &self,
        task_id: Uuid,
        progress: &TaskProgress,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE report_tasks
            SET attempted = ?, succeeded = ?, failed = ?, skipped = ?, total = ?,
                last_learner_id = ?, report_bytes = ?, error_bytes = ?, updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(progress.attempted as i64)
        .bind(progress.succeeded as i64)
        .bind(progress.failed as i64)
        .bind(progress.skipped as i64)
        .bind(progress.total as i64)
        .bind(checkpoint.last_learner_id)
        .bind(checkpoint.report_bytes as i64)
        .bind(checkpoint.error_bytes as i64)
        .bind(time::to_db(&time::now()))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, task_id: Uuid, status: ReportStatus) -> Result<()> {
        sqlx::query("UPDATE report_tasks SET status = ?, updated_at = ? WHERE task_id = ?")
            .bind(status.as_str())
            .bind(time::to_db(&time::now()))
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        task_id: Uuid,
        report_location: &str,
        error_location: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE report_tasks
            SET status = ?, report_location = ?, error_location = ?, updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(ReportStatus::Succeeded.as_str())
        .bind(report_location)
        .bind(error_location)
        .bind(time::to_db(&time::now()))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<ReportTask> {
    let task_id: String = row.try_get("task_id")?;
    let course_id: String = row.try_get("course_id")?;
    let status: String = row.try_get("status")?;
    let filters: String = row.try_get("filters")?;
    let work_dir: String = row.try_get("work_dir")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let count = |name: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };

    Ok(ReportTask {
        task_id: Uuid::parse_str(&task_id).map_err(|e| {
            grades_common::Error::Internal(format!("Bad task id '{}': {}", task_id, e))
        })?,
        course_id: course_id.parse()?,
        report_kind: row.try_get("report_kind")?,
        status: status.parse()?,
        filters: serde_json::from_str(&filters)?,
        progress: TaskProgress {
            attempted: count("attempted")?,
            succeeded: count("succeeded")?,
            failed: count("failed")?,
            skipped: count("skipped")?,
            total: count("total")?,
        },
        checkpoint: Checkpoint {
            last_learner_id: row.try_get("last_learner_id")?,
            report_bytes: count("report_bytes")?,
            error_bytes: count("error_bytes")?,
        },
        work_dir: PathBuf::from(work_dir),
        report_location: row.try_get("report_location")?,
        error_location: row.try_get("error_location")?,
        created_at: time::from_db(&created_at)?,
        updated_at: time::from_db(&updated_at)?,
    })
}
