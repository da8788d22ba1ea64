//! Persisted subsection grades
//!
//! Rows hold effective values (computed, then overlaid by any active
//! override). `first_attempted` is write-once.

use crate::error::Result;
use crate::stores::scores::placeholders;
use chrono::{DateTime, Utc};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsectionGradeRow {
    pub id: i64,
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub subsection_id: UsageKey,
    pub course_version: String,
    pub subsection_edited_at: DateTime<Utc>,
    pub earned_all: f64,
    pub possible_all: f64,
    pub earned_graded: f64,
    pub possible_graded: f64,
    pub first_attempted: Option<DateTime<Utc>>,
    pub visible_blocks_hash: String,
    pub overridden: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SubsectionGradeRow {
    pub fn attempted(&self) -> bool {
        self.first_attempted.is_some()
    }

    pub fn percent_graded(&self) -> f64 {
        percent(self.earned_graded, self.possible_graded)
    }

    pub fn percent_all(&self) -> f64 {
        percent(self.earned_all, self.possible_all)
    }
}

/// earned / possible, zero when nothing is possible
pub fn percent(earned: f64, possible: f64) -> f64 {
    if possible > 0.0 {
        (earned / possible).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubsectionGradeWrite {
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub subsection_id: UsageKey,
    pub course_version: String,
    pub subsection_edited_at: DateTime<Utc>,
    pub earned_all: f64,
    pub possible_all: f64,
    pub earned_graded: f64,
    pub possible_graded: f64,
    pub first_attempted: Option<DateTime<Utc>>,
    pub visible_blocks_hash: String,
    pub overridden: bool,
}

const SELECT_COLUMNS: &str = "id, learner_id, course_id, subsection_id, course_version, \
     subsection_edited_at, earned_all, possible_all, earned_graded, possible_graded, \
     first_attempted, visible_blocks_hash, overridden, created_at, modified_at";

#[derive(Clone)]
pub struct SubsectionGradeStore {
    pool: SqlitePool,
}

impl SubsectionGradeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update the grade for (learner, subsection)
    ///
    /// An existing `first_attempted` is never replaced.
    pub async fn upsert_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        write: &SubsectionGradeWrite,
    ) -> Result<SubsectionGradeRow> {
        let now = time::to_db(&time::now());
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subsection_grades (
                learner_id, course_id, subsection_id, course_version, subsection_edited_at,
                earned_all, possible_all, earned_graded, possible_graded, first_attempted,
                visible_blocks_hash, overridden, created_at, modified_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(learner_id, subsection_id) DO UPDATE SET
                course_version = excluded.course_version,
                subsection_edited_at = excluded.subsection_edited_at,
                earned_all = excluded.earned_all,
                possible_all = excluded.possible_all,
                earned_graded = excluded.earned_graded,
                possible_graded = excluded.possible_graded,
                first_attempted = COALESCE(subsection_grades.first_attempted, excluded.first_attempted),
                visible_blocks_hash = excluded.visible_blocks_hash,
                overridden = excluded.overridden,
                modified_at = excluded.modified_at
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(write.learner_id)
        .bind(write.course_id.normalized().to_string())
        .bind(write.subsection_id.normalized().to_string())
        .bind(&write.course_version)
        .bind(time::to_db(&write.subsection_edited_at))
        .bind(write.earned_all)
        .bind(write.possible_all)
        .bind(write.earned_graded)
        .bind(write.possible_graded)
        .bind(time::opt_to_db(write.first_attempted.as_ref()))
        .bind(&write.visible_blocks_hash)
        .bind(write.overridden)
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut **tx)
        .await?;

        row_to_grade(&row)
    }

    pub async fn get_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        learner_id: LearnerId,
        subsection: &UsageKey,
    ) -> Result<Option<SubsectionGradeRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM subsection_grades WHERE learner_id = ? AND subsection_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(subsection.normalized().to_string())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| row_to_grade(&row))
        .transpose()
    }

    pub async fn get_by_id_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
    ) -> Result<Option<SubsectionGradeRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM subsection_grades WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| row_to_grade(&row))
        .transpose()
    }

    pub async fn get(
        &self,
        learner_id: LearnerId,
        subsection: &UsageKey,
    ) -> Result<Option<SubsectionGradeRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM subsection_grades WHERE learner_id = ? AND subsection_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(subsection.normalized().to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_grade(&row))
        .transpose()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<SubsectionGradeRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM subsection_grades WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_grade(&row))
        .transpose()
    }

    /// A learner's grades in a course, keyed by subsection
    pub async fn for_learner(
        &self,
        learner_id: LearnerId,
        course: &CourseKey,
    ) -> Result<HashMap<UsageKey, SubsectionGradeRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subsection_grades WHERE learner_id = ? AND course_id = ?",
            SELECT_COLUMNS
        ))
        .bind(learner_id)
        .bind(course.normalized().to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_grade(row).map(|g| (g.subsection_id.clone(), g)))
            .collect()
    }

    /// Bulk prefetch for a batch of learners
    pub async fn for_learners(
        &self,
        course: &CourseKey,
        learners: &[LearnerId],
    ) -> Result<HashMap<LearnerId, HashMap<UsageKey, SubsectionGradeRow>>> {
        let mut out: HashMap<LearnerId, HashMap<UsageKey, SubsectionGradeRow>> = HashMap::new();
        if learners.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT {} FROM subsection_grades WHERE course_id = ? AND learner_id IN ({})",
            SELECT_COLUMNS,
            placeholders(learners.len())
        );
        let mut query = sqlx::query(&sql).bind(course.normalized().to_string());
        for id in learners {
            query = query.bind(*id);
        }
        for row in query.fetch_all(&self.pool).await? {
            let grade = row_to_grade(&row)?;
            out.entry(grade.learner_id)
                .or_default()
                .insert(grade.subsection_id.clone(), grade);
        }
        Ok(out)
    }

    /// Delete a learner's grades in a course; overrides cascade
    pub async fn delete_for_learner_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        learner_id: LearnerId,
        course: &CourseKey,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM subsection_grades WHERE learner_id = ? AND course_id = ?")
            .bind(learner_id)
            .bind(course.normalized().to_string())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_grade(row: &SqliteRow) -> Result<SubsectionGradeRow> {
    let course_id: String = row.try_get("course_id")?;
    let subsection_id: String = row.try_get("subsection_id")?;
    let edited_at: String = row.try_get("subsection_edited_at")?;
    let created_at: String = row.try_get("created_at")?;
    let modified_at: String = row.try_get("modified_at")?;
    Ok(SubsectionGradeRow {
        id: row.try_get("id")?,
        learner_id: row.try_get("learner_id")?,
        course_id: course_id.parse()?,
        subsection_id: subsection_id.parse()?,
        course_version: row.try_get("course_version")?,
        subsection_edited_at: time::from_db(&edited_at)?,
        earned_all: row.try_get("earned_all")?,
        possible_all: row.try_get("possible_all")?,
        earned_graded: row.try_get("earned_graded")?,
        possible_graded: row.try_get("possible_graded")?,
        first_attempted: time::opt_from_db(row.try_get("first_attempted")?)?,
        visible_blocks_hash: row.try_get("visible_blocks_hash")?,
        overridden: row.try_get("overridden")?,
        created_at: time::from_db(&created_at)?,
        modified_at: time::from_db(&modified_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::visible_blocks::{VisibleBlocks, VisibleBlocksStore};
    use grades_common::db::init_memory_database;

    fn course() -> CourseKey {
        "course-v1:Org+C1+R1".parse().unwrap()
    }

    fn write(first_attempted: Option<DateTime<Utc>>, earned: f64, hash: &str) -> SubsectionGradeWrite {
        SubsectionGradeWrite {
            learner_id: 1,
            course_id: course(),
            subsection_id: course().make_usage_key("sequential", "hw1").unwrap(),
            course_version: "v1".into(),
            subsection_edited_at: time::now(),
            earned_all: earned,
            possible_all: 10.0,
            earned_graded: earned,
            possible_graded: 10.0,
            first_attempted,
            visible_blocks_hash: hash.into(),
            overridden: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_first_attempted() {
        let pool = init_memory_database().await.unwrap();
        let store = SubsectionGradeStore::new(pool.clone());
        let t1 = time::now();

        let mut tx = pool.begin().await.unwrap();
        let hash = VisibleBlocksStore::ensure_in_tx(&mut tx, &VisibleBlocks::new(course(), vec![]))
            .await
            .unwrap();
        let first = SubsectionGradeStore::upsert_in_tx(&mut tx, &write(Some(t1), 5.0, &hash))
            .await
            .unwrap();
        let t2 = t1 + chrono::Duration::seconds(60);
        let second = SubsectionGradeStore::upsert_in_tx(&mut tx, &write(Some(t2), 8.0, &hash))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.first_attempted, Some(t1));
        assert_eq!(second.earned_graded, 8.0);
        assert_eq!(second.percent_graded(), 0.8);

        let by_id = store.get_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(by_id, second);
    }

    #[tokio::test]
    async fn test_unknown_visible_blocks_hash_is_fatal() {
        let pool = init_memory_database().await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        let err = SubsectionGradeStore::upsert_in_tx(&mut tx, &write(None, 0.0, "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "fatal_store_error");
    }

    #[test]
    fn test_percent_zero_possible() {
        assert_eq!(percent(0.0, 0.0), 0.0);
        assert_eq!(percent(3.0, 4.0), 0.75);
    }
}
