//! Persisted course grades
//!
//! `passed_at` is set the first time a learner passes and then kept even if
//! the grade later drops below the threshold.

use crate::error::Result;
use crate::stores::scores::placeholders;
use chrono::{DateTime, Utc};
use grades_common::time;
use grades_common::{CourseKey, LearnerId};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseGradeRow {
    pub id: i64,
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub course_edited_at: DateTime<Utc>,
    pub grading_policy_hash: String,
    pub percent_grade: f64,
    pub letter_grade: Option<String>,
    pub passed: bool,
    pub passed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseGradeWrite {
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub course_edited_at: DateTime<Utc>,
    pub grading_policy_hash: String,
    pub percent_grade: f64,
    pub letter_grade: Option<String>,
    pub passed: bool,
    /// Used only when the row has no `passed_at` yet
    pub passed_at: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str = "id, learner_id, course_id, course_edited_at, grading_policy_hash, \
     percent_grade, letter_grade, passed, passed_at, created_at, modified_at";

#[derive(Clone)]
pub struct CourseGradeStore {
    pool: SqlitePool,
}

impl CourseGradeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        write: &CourseGradeWrite,
    ) -> Result<CourseGradeRow> {
        let now = time::to_db(&time::now());
        let passed_at = if write.passed {
            time::opt_to_db(write.passed_at.as_ref())
        } else {
            None
        };
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO course_grades (
                learner_id, course_id, course_edited_at, grading_policy_hash, percent_grade,
                letter_grade, passed, passed_at, created_at, modified_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(learner_id, course_id) DO UPDATE SET
                course_edited_at = excluded.course_edited_at,
                grading_policy_hash = excluded.grading_policy_hash,
                percent_grade = excluded.percent_grade,
                letter_grade = excluded.letter_grade,
                passed = excluded.passed,
                passed_at = COALESCE(course_grades.passed_at, excluded.passed_at),
                modified_at = excluded.modified_at
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(write.learner_id)
        .bind(write.course_id.normalized().to_string())
        .bind(time::to_db(&write.course_edited_at))
        .bind(&write.grading_policy_hash)
        .bind(write.percent_grade)
        .bind(write.letter_grade.as_deref())
        .bind(write.passed)
        .bind(passed_at)
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut **tx)
        .await?;

        row_to_course_grade(&row)
    }

    pub async fn get_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        learner_id: LearnerId,
        course: &CourseKey,
    ) -> Result<Option<CourseGradeRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM course_grades WHERE learner_id = ? AND course_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(course.normalized().to_string())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| row_to_course_grade(&row))
        .transpose()
    }

    pub async fn get(&self, learner_id: LearnerId, course: &CourseKey) -> Result<Option<CourseGradeRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM course_grades WHERE learner_id = ? AND course_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(course.normalized().to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_course_grade(&row))
        .transpose()
    }

    pub async fn for_learners(
        &self,
        course: &CourseKey,
        learners: &[LearnerId],
    ) -> Result<HashMap<LearnerId, CourseGradeRow>> {
        if learners.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT {} FROM course_grades WHERE course_id = ? AND learner_id IN ({})",
            SELECT_COLUMNS,
            placeholders(learners.len())
        );
        let mut query = sqlx::query(&sql).bind(course.normalized().to_string());
        for id in learners {
            query = query.bind(*id);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row_to_course_grade(row).map(|g| (g.learner_id, g)))
            .collect()
    }

    pub async fn delete_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        learner_id: LearnerId,
        course: &CourseKey,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM course_grades WHERE learner_id = ? AND course_id = ?")
            .bind(learner_id)
            .bind(course.normalized().to_string())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_course_grade(row: &SqliteRow) -> Result<CourseGradeRow> {
    let course_id: String = row.try_get("course_id")?;
    let edited_at: String = row.try_get("course_edited_at")?;
    let created_at: String = row.try_get("created_at")?;
    let modified_at: String = row.try_get("modified_at")?;
    Ok(CourseGradeRow {
        id: row.try_get("id")?,
        learner_id: row.try_get("learner_id")?,
        course_id: course_id.parse()?,
        course_edited_at: time::from_db(&edited_at)?,
        grading_policy_hash: row.try_get("grading_policy_hash")?,
        percent_grade: row.try_get("percent_grade")?,
        letter_grade: row.try_get("letter_grade")?,
        passed: row.try_get("passed")?,
        passed_at: time::opt_from_db(row.try_get("passed_at")?)?,
        created_at: time::from_db(&created_at)?,
        modified_at: time::from_db(&modified_at)?,
    })
}
