//! Subsection grade overrides and their history
//!
//! At most one active override per subsection grade. Every mutation appends
//! exactly one history row (`+` create, `~` change, `-` delete) stamped with
//! the mutation time, and queues a forced recompute of the subsection.

use crate::error::{GradesError, Result};
use crate::scheduler::{GradeQueue, GradeWork};
use crate::stores::frozen::FrozenGuard;
use crate::stores::subsection_grades::{SubsectionGradeRow, SubsectionGradeStore};
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{OverrideChanged, OverrideFeature, OverrideFields};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideRequest {
    pub fields: OverrideFields,
    pub reason_code: String,
    pub feature: OverrideFeature,
    pub actor_id: Option<i64>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsectionOverride {
    pub id: i64,
    pub grade_id: i64,
    pub fields: OverrideFields,
    pub reason_code: String,
    pub feature: OverrideFeature,
    pub actor_id: Option<i64>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HistoryType {
    Created,
    Changed,
    Deleted,
}

impl HistoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryType::Created => "+",
            HistoryType::Changed => "~",
            HistoryType::Deleted => "-",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(HistoryType::Created),
            "~" => Ok(HistoryType::Changed),
            "-" => Ok(HistoryType::Deleted),
            other => Err(GradesError::Common(grades_common::Error::Internal(format!(
                "Unknown history type '{}'",
                other
            )))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideHistoryEntry {
    pub history_id: i64,
    pub override_id: i64,
    pub grade_id: i64,
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub subsection_id: UsageKey,
    pub fields: OverrideFields,
    pub reason_code: String,
    pub feature: OverrideFeature,
    pub actor_id: Option<i64>,
    pub comment: Option<String>,
    pub history_type: HistoryType,
    pub history_date: DateTime<Utc>,
    pub history_actor_id: Option<i64>,
}

/// Apply override fields over computed values
pub fn apply_fields(
    fields: &OverrideFields,
    earned_all: f64,
    possible_all: f64,
    earned_graded: f64,
    possible_graded: f64,
) -> (f64, f64, f64, f64) {
    (
        fields.earned_all.unwrap_or(earned_all),
        fields.possible_all.unwrap_or(possible_all),
        fields.earned_graded.unwrap_or(earned_graded),
        fields.possible_graded.unwrap_or(possible_graded),
    )
}

/// Check an override against the grade it targets
///
/// Unset fields fall back to the grade's persisted values.
fn validate_fields(
    fields: &OverrideFields,
    grade: &SubsectionGradeRow,
    previous: Option<&SubsectionOverride>,
) -> Result<()> {
    if fields.is_empty() {
        return Err(GradesError::InvalidOverride("No override values supplied".into()));
    }
    for value in [
        fields.earned_all,
        fields.possible_all,
        fields.earned_graded,
        fields.possible_graded,
    ]
    .into_iter()
    .flatten()
    {
        if !(value >= 0.0) {
            return Err(GradesError::InvalidOverride(format!(
                "Override value {} is negative",
                value
            )));
        }
    }

    if let Some(prev) = previous {
        if prev.fields.possible_graded.is_some()
            && fields.possible_graded.is_none()
            && fields.earned_graded.is_some()
        {
            return Err(GradesError::InvalidOverride(
                "Cannot clear possible_graded while keeping earned_graded".into(),
            ));
        }
    }

    let (earned_all, possible_all, earned_graded, possible_graded) = apply_fields(
        fields,
        grade.earned_all,
        grade.possible_all,
        grade.earned_graded,
        grade.possible_graded,
    );
    if earned_all > possible_all {
        return Err(GradesError::InvalidOverride(format!(
            "earned_all {} exceeds possible_all {}",
            earned_all, possible_all
        )));
    }
    if earned_graded > possible_graded {
        return Err(GradesError::InvalidOverride(format!(
            "earned_graded {} exceeds possible_graded {}",
            earned_graded, possible_graded
        )));
    }
    Ok(())
}

fn unknown_grade(grade_id: i64) -> GradesError {
    GradesError::InvalidOverride(format!("Unknown subsection grade {}", grade_id))
}

const OVERRIDE_COLUMNS: &str = "id, grade_id, earned_all_override, possible_all_override, \
     earned_graded_override, possible_graded_override, reason_code, feature, actor_id, comment, \
     created_at, modified_at";

#[derive(Clone)]
pub struct OverrideStore {
    pool: SqlitePool,
    grades: SubsectionGradeStore,
    frozen: FrozenGuard,
    queue: Option<GradeQueue>,
    history_limit: usize,
    max_lock_wait_ms: u64,
}

impl OverrideStore {
    pub fn new(pool: SqlitePool, frozen: FrozenGuard, history_limit: usize, max_lock_wait_ms: u64) -> Self {
        Self {
            grades: SubsectionGradeStore::new(pool.clone()),
            pool,
            frozen,
            queue: None,
            history_limit,
            max_lock_wait_ms,
        }
    }

    /// Queue recomputes on this queue after each mutation
    pub fn with_queue(mut self, queue: GradeQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    async fn target_grade(&self, grade_id: i64) -> Result<SubsectionGradeRow> {
        let grade = self
            .grades
            .get_by_id(grade_id)
            .await?
            .ok_or_else(|| unknown_grade(grade_id))?;
        self.frozen.ensure_not_frozen(&grade.course_id).await?;
        Ok(grade)
    }

    /// Create or replace the active override on a subsection grade
    pub async fn upsert(
        &self,
        grade_id: i64,
        request: &OverrideRequest,
        event_transaction_id: Uuid,
    ) -> Result<SubsectionOverride> {
        self.target_grade(grade_id).await?;
        let (grade, saved) = retry_on_lock("override upsert", self.max_lock_wait_ms, || {
            self.upsert_once(grade_id, request)
        })
        .await?;

        info!(
            grade_id,
            learner_id = grade.learner_id,
            subsection = %grade.subsection_id,
            feature = %request.feature,
            "Subsection override saved"
        );
        self.notify(&grade, request.feature, false, saved.modified_at, event_transaction_id);
        Ok(saved)
    }

    /// Validation and write share one transaction, so the override is
    /// checked against the grade row it lands on
    async fn upsert_once(
        &self,
        grade_id: i64,
        request: &OverrideRequest,
    ) -> Result<(SubsectionGradeRow, SubsectionOverride)> {
        let mut tx = self.pool.begin().await?;
        let grade = SubsectionGradeStore::get_by_id_in_tx(&mut tx, grade_id)
            .await?
            .ok_or_else(|| unknown_grade(grade_id))?;
        let previous = Self::active_in_tx(&mut tx, grade.id).await?;
        validate_fields(&request.fields, &grade, previous.as_ref())?;

        let now = time::to_db(&time::now());
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subsection_overrides (
                grade_id, earned_all_override, possible_all_override, earned_graded_override,
                possible_graded_override, reason_code, feature, actor_id, comment, created_at, modified_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(grade_id) DO UPDATE SET
                earned_all_override = excluded.earned_all_override,
                possible_all_override = excluded.possible_all_override,
                earned_graded_override = excluded.earned_graded_override,
                possible_graded_override = excluded.possible_graded_override,
                reason_code = excluded.reason_code,
                feature = excluded.feature,
                actor_id = excluded.actor_id,
                comment = excluded.comment,
                modified_at = excluded.modified_at
            RETURNING {}
            "#,
            OVERRIDE_COLUMNS
        ))
        .bind(grade.id)
        .bind(request.fields.earned_all)
        .bind(request.fields.possible_all)
        .bind(request.fields.earned_graded)
        .bind(request.fields.possible_graded)
        .bind(&request.reason_code)
        .bind(request.feature.as_str())
        .bind(request.actor_id)
        .bind(request.comment.as_deref())
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;
        let saved = row_to_override(&row)?;

        let kind = if previous.is_some() {
            HistoryType::Changed
        } else {
            HistoryType::Created
        };
        Self::append_history(&mut tx, &saved, &grade, kind, saved.modified_at, request.actor_id).await?;
        tx.commit().await?;
        Ok((grade, saved))
    }

    /// Remove the active override, keeping its history
    ///
    /// Returns the removed override, or `None` when there was none.
    pub async fn delete(
        &self,
        grade_id: i64,
        actor_id: Option<i64>,
        event_transaction_id: Uuid,
    ) -> Result<Option<SubsectionOverride>> {
        let grade = self.target_grade(grade_id).await?;
        let removed = retry_on_lock("override delete", self.max_lock_wait_ms, || {
            self.delete_once(&grade, actor_id)
        })
        .await?;

        if let Some((removed, deleted_at)) = &removed {
            info!(grade_id, learner_id = grade.learner_id, "Subsection override deleted");
            self.notify(&grade, removed.feature, true, *deleted_at, event_transaction_id);
        }
        Ok(removed.map(|(o, _)| o))
    }

    async fn delete_once(
        &self,
        grade: &SubsectionGradeRow,
        actor_id: Option<i64>,
    ) -> Result<Option<(SubsectionOverride, DateTime<Utc>)>> {
        let mut tx = self.pool.begin().await?;
        let Some(active) = Self::active_in_tx(&mut tx, grade.id).await? else {
            return Ok(None);
        };
        let deleted_at = time::now();
        sqlx::query("DELETE FROM subsection_overrides WHERE id = ?")
            .bind(active.id)
            .execute(&mut *tx)
            .await?;
        Self::append_history(&mut tx, &active, grade, HistoryType::Deleted, deleted_at, actor_id).await?;
        tx.commit().await?;
        Ok(Some((active, deleted_at)))
    }

    /// Write `-` history for every active override of a learner in a course
    ///
    /// Runs before the grade rows are deleted; the override rows themselves
    /// go with the grades.
    pub async fn record_reset_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        learner_id: LearnerId,
        course: &CourseKey,
        actor_id: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT g.id AS grade_id
            FROM subsection_overrides o
            JOIN subsection_grades g ON g.id = o.grade_id
            WHERE g.learner_id = ? AND g.course_id = ?
            "#,
        )
        .bind(learner_id)
        .bind(course.normalized().to_string())
        .fetch_all(&mut **tx)
        .await?;

        let mut written = 0;
        for row in rows {
            let grade_id: i64 = row.try_get("grade_id")?;
            let Some(active) = Self::active_in_tx(tx, grade_id).await? else {
                continue;
            };
            let Some(grade) = SubsectionGradeStore::get_by_id_in_tx(tx, grade_id).await? else {
                continue;
            };
            Self::append_history(tx, &active, &grade, HistoryType::Deleted, at, actor_id).await?;
            written += 1;
        }
        Ok(written)
    }

    fn notify(
        &self,
        grade: &SubsectionGradeRow,
        feature: OverrideFeature,
        deleted: bool,
        modified_at: DateTime<Utc>,
        event_transaction_id: Uuid,
    ) {
        let Some(queue) = &self.queue else {
            return;
        };
        let change = OverrideChanged {
            event_transaction_id,
            learner_id: grade.learner_id,
            course_id: grade.course_id.clone(),
            subsection_id: grade.subsection_id.clone(),
            feature,
            deleted,
            modified_at,
        };
        if let Err(e) = queue.enqueue(GradeWork::OverrideChanged(change)) {
            warn!(grade_id = grade.id, error = %e, "Failed to queue override recompute");
        }
    }

    async fn append_history(
        tx: &mut Transaction<'_, Sqlite>,
        o: &SubsectionOverride,
        grade: &SubsectionGradeRow,
        kind: HistoryType,
        at: DateTime<Utc>,
        history_actor_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subsection_override_history (
                override_id, grade_id, learner_id, course_id, subsection_id,
                earned_all_override, possible_all_override, earned_graded_override,
                possible_graded_override, reason_code, feature, actor_id, comment,
                history_type, history_date, history_actor_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(o.id)
        .bind(grade.id)
        .bind(grade.learner_id)
        .bind(grade.course_id.to_string())
        .bind(grade.subsection_id.to_string())
        .bind(o.fields.earned_all)
        .bind(o.fields.possible_all)
        .bind(o.fields.earned_graded)
        .bind(o.fields.possible_graded)
        .bind(&o.reason_code)
        .bind(o.feature.as_str())
        .bind(o.actor_id)
        .bind(o.comment.as_deref())
        .bind(kind.as_str())
        .bind(time::to_db(&at))
        .bind(history_actor_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn active_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        grade_id: i64,
    ) -> Result<Option<SubsectionOverride>> {
        sqlx::query(&format!(
            "SELECT {} FROM subsection_overrides WHERE grade_id = ?",
            OVERRIDE_COLUMNS
        ))
        .bind(grade_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| row_to_override(&row))
        .transpose()
    }

    pub async fn active(&self, grade_id: i64) -> Result<Option<SubsectionOverride>> {
        sqlx::query(&format!(
            "SELECT {} FROM subsection_overrides WHERE grade_id = ?",
            OVERRIDE_COLUMNS
        ))
        .bind(grade_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_override(&row))
        .transpose()
    }

    /// Active override plus history, newest first
    ///
    /// `limit` defaults to the configured history limit.
    pub async fn read_with_history(
        &self,
        grade_id: i64,
        limit: Option<usize>,
    ) -> Result<(Option<SubsectionOverride>, Vec<OverrideHistoryEntry>)> {
        let active = self.active(grade_id).await?;
        let limit = limit.unwrap_or(self.history_limit);
        let rows = sqlx::query(
            r#"
            SELECT history_id, override_id, grade_id, learner_id, course_id, subsection_id,
                   earned_all_override, possible_all_override, earned_graded_override,
                   possible_graded_override, reason_code, feature, actor_id, comment,
                   history_type, history_date, history_actor_id
            FROM subsection_override_history
            WHERE grade_id = ?
            ORDER BY history_id DESC
            LIMIT ?
            "#,
        )
        .bind(grade_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let history = rows
            .iter()
            .map(row_to_history)
            .collect::<Result<Vec<_>>>()?;
        Ok((active, history))
    }
}

fn fields_from_row(row: &SqliteRow) -> Result<OverrideFields> {
    Ok(OverrideFields {
        earned_all: row.try_get("earned_all_override")?,
        possible_all: row.try_get("possible_all_override")?,
        earned_graded: row.try_get("earned_graded_override")?,
        possible_graded: row.try_get("possible_graded_override")?,
    })
}

fn row_to_override(row: &SqliteRow) -> Result<SubsectionOverride> {
    let feature: String = row.try_get("feature")?;
    let created_at: String = row.try_get("created_at")?;
    let modified_at: String = row.try_get("modified_at")?;
    Ok(SubsectionOverride {
        id: row.try_get("id")?,
        grade_id: row.try_get("grade_id")?,
        fields: fields_from_row(row)?,
        reason_code: row.try_get("reason_code")?,
        feature: feature.parse()?,
        actor_id: row.try_get("actor_id")?,
        comment: row.try_get("comment")?,
        created_at: time::from_db(&created_at)?,
        modified_at: time::from_db(&modified_at)?,
    })
}

fn row_to_history(row: &SqliteRow) -> Result<OverrideHistoryEntry> {
    let course_id: String = row.try_get("course_id")?;
    let subsection_id: String = row.try_get("subsection_id")?;
    let feature: String = row.try_get("feature")?;
    let history_type: String = row.try_get("history_type")?;
    let history_date: String = row.try_get("history_date")?;
    Ok(OverrideHistoryEntry {
        history_id: row.try_get("history_id")?,
        override_id: row.try_get("override_id")?,
        grade_id: row.try_get("grade_id")?,
        learner_id: row.try_get("learner_id")?,
        course_id: course_id.parse()?,
        subsection_id: subsection_id.parse()?,
        fields: fields_from_row(row)?,
        reason_code: row.try_get("reason_code")?,
        feature: feature.parse()?,
        actor_id: row.try_get("actor_id")?,
        comment: row.try_get("comment")?,
        history_type: HistoryType::parse(&history_type)?,
        history_date: time::from_db(&history_date)?,
        history_actor_id: row.try_get("history_actor_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::subsection_grades::SubsectionGradeWrite;
    use crate::stores::visible_blocks::{VisibleBlocks, VisibleBlocksStore};
    use crate::structure::test_support::{course, key, two_homeworks};
    use crate::structure::InMemoryCourseStructure;
    use grades_common::db::init_memory_database;
    use std::sync::Arc;

    async fn setup() -> (OverrideStore, FrozenGuard, SubsectionGradeRow) {
        let pool = init_memory_database().await.unwrap();
        let structure = InMemoryCourseStructure::new();
        structure.insert(two_homeworks()).await.unwrap();
        let frozen = FrozenGuard::new(pool.clone(), Arc::new(structure), None);

        let mut tx = pool.begin().await.unwrap();
        let hash = VisibleBlocksStore::ensure_in_tx(&mut tx, &VisibleBlocks::new(course(), vec![]))
            .await
            .unwrap();
        let grade = SubsectionGradeStore::upsert_in_tx(
            &mut tx,
            &SubsectionGradeWrite {
                learner_id: 1,
                course_id: course(),
                subsection_id: key("sequential", "hw1"),
                course_version: "v1".into(),
                subsection_edited_at: time::now(),
                earned_all: 6.0,
                possible_all: 10.0,
                earned_graded: 6.0,
                possible_graded: 10.0,
                first_attempted: Some(time::now()),
                visible_blocks_hash: hash,
                overridden: false,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        (OverrideStore::new(pool, frozen.clone(), 100, 1000), frozen, grade)
    }

    fn request(fields: OverrideFields) -> OverrideRequest {
        OverrideRequest {
            fields,
            reason_code: "regrade".into(),
            feature: OverrideFeature::Gradebook,
            actor_id: Some(99),
            comment: None,
        }
    }

    fn earned_graded(v: f64) -> OverrideFields {
        OverrideFields {
            earned_graded: Some(v),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_each_mutation_writes_one_history_row() {
        let (store, _, grade) = setup().await;
        let txn = Uuid::new_v4();

        let created = store.upsert(grade.id, &request(earned_graded(9.0)), txn).await.unwrap();
        let changed = store.upsert(grade.id, &request(earned_graded(8.0)), txn).await.unwrap();
        assert_eq!(created.id, changed.id);
        let removed = store.delete(grade.id, Some(7), txn).await.unwrap();
        assert!(removed.is_some());
        assert!(store.delete(grade.id, Some(7), txn).await.unwrap().is_none());

        let (active, history) = store.read_with_history(grade.id, None).await.unwrap();
        assert!(active.is_none());
        let kinds: Vec<_> = history.iter().map(|h| h.history_type).collect();
        assert_eq!(
            kinds,
            vec![HistoryType::Deleted, HistoryType::Changed, HistoryType::Created]
        );
        assert_eq!(history[2].history_date, created.modified_at);
        assert_eq!(history[1].history_date, changed.modified_at);
        assert_eq!(history[0].history_actor_id, Some(7));
        assert_eq!(history[0].fields.earned_graded, Some(8.0));
    }

    #[tokio::test]
    async fn test_history_limit() {
        let (store, _, grade) = setup().await;
        for v in [1.0, 2.0, 3.0] {
            store.upsert(grade.id, &request(earned_graded(v)), Uuid::new_v4()).await.unwrap();
        }
        let (active, history) = store.read_with_history(grade.id, Some(2)).await.unwrap();
        assert_eq!(active.unwrap().fields.earned_graded, Some(3.0));
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_overrides() {
        let (store, _, grade) = setup().await;
        let txn = Uuid::new_v4();

        let err = store.upsert(grade.id, &request(earned_graded(11.0)), txn).await.unwrap_err();
        assert_eq!(err.code(), "invalid_override");

        let err = store
            .upsert(grade.id, &request(OverrideFields::default()), txn)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_override");

        let err = store.upsert(9999, &request(earned_graded(1.0)), txn).await.unwrap_err();
        assert_eq!(err.code(), "invalid_override");
    }

    #[tokio::test]
    async fn test_clearing_possible_graded_requires_clearing_earned() {
        let (store, _, grade) = setup().await;
        let txn = Uuid::new_v4();
        let both = OverrideFields {
            earned_graded: Some(4.0),
            possible_graded: Some(5.0),
            ..Default::default()
        };
        store.upsert(grade.id, &request(both), txn).await.unwrap();

        let err = store.upsert(grade.id, &request(earned_graded(4.0)), txn).await.unwrap_err();
        assert_eq!(err.code(), "invalid_override");
    }

    #[tokio::test]
    async fn test_override_checked_against_current_grade_row() {
        let (store, _, stale) = setup().await;
        let mut tx = store.pool.begin().await.unwrap();
        SubsectionGradeStore::upsert_in_tx(
            &mut tx,
            &SubsectionGradeWrite {
                learner_id: 1,
                course_id: course(),
                subsection_id: key("sequential", "hw1"),
                course_version: "v2".into(),
                subsection_edited_at: time::now(),
                earned_all: 3.0,
                possible_all: 5.0,
                earned_graded: 3.0,
                possible_graded: 5.0,
                first_attempted: stale.first_attempted,
                visible_blocks_hash: stale.visible_blocks_hash.clone(),
                overridden: false,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        // Valid against the old 10-point row, not the recomputed one
        let err = store
            .upsert_once(stale.id, &request(earned_graded(8.0)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_override");

        let (grade, saved) = store.upsert_once(stale.id, &request(earned_graded(4.0))).await.unwrap();
        assert_eq!(grade.possible_graded, 5.0);
        assert_eq!(saved.grade_id, stale.id);
        let (_, history) = store.read_with_history(stale.id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].history_type, HistoryType::Created);
    }

    #[tokio::test]
    async fn test_frozen_course_rejects_mutation() {
        let (store, frozen, grade) = setup().await;
        frozen.freeze(&course(), None, None).await.unwrap();
        let err = store
            .upsert(grade.id, &request(earned_graded(5.0)), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "grades_frozen");

        let (_, history) = store.read_with_history(grade.id, None).await.unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_apply_fields() {
        let fields = OverrideFields {
            earned_all: Some(0.0),
            earned_graded: Some(0.0),
            ..Default::default()
        };
        assert_eq!(apply_fields(&fields, 5.0, 10.0, 5.0, 10.0), (0.0, 10.0, 0.0, 10.0));
    }
}
