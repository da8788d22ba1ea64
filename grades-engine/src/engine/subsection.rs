//! Subsection grade computation
//!
//! Sums weighted block scores over a subsection's scorable blocks, overlays
//! any active override and persists the result with its visible block
//! record in one transaction.

use crate::context::GradeContext;
use crate::error::Result;
use crate::stores::overrides::apply_fields;
use crate::stores::{
    BlockRecord, BlockScore, OverrideStore, ScoreStore, SubsectionGradeRow, SubsectionGradeStore,
    SubsectionGradeWrite, SubsectionOverride, VisibleBlocks, VisibleBlocksStore,
};
use crate::structure::{unknown_subsection, SubsectionInfo};
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use grades_common::events::{EventBus, GradeEvent};
use grades_common::time;
use grades_common::{LearnerId, UsageKey};
use serde::Serialize;
use sqlx::SqlitePool;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Aggregate of block scores before overrides
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedSubsection {
    pub earned_all: f64,
    pub possible_all: f64,
    pub earned_graded: f64,
    pub possible_graded: f64,
    pub first_attempted: Option<DateTime<Utc>>,
    pub visible_blocks: VisibleBlocks,
}

/// Sum block scores for one subsection
///
/// A block without a live score row contributes zero earned and its
/// structure-derived possible. The earliest live score marks the first
/// attempt.
pub fn aggregate(
    subsection: &SubsectionInfo,
    scores: &HashMap<UsageKey, BlockScore>,
) -> ComputedSubsection {
    let mut earned_all = 0.0;
    let mut possible_all = 0.0;
    let mut first_attempted: Option<DateTime<Utc>> = None;
    let mut records = Vec::with_capacity(subsection.blocks.len());

    for block in &subsection.blocks {
        let (earned, possible) = match scores.get(&block.usage_key).filter(|s| !s.deleted) {
            Some(score) => {
                first_attempted = Some(match first_attempted {
                    Some(t) => t.min(score.modified_at),
                    None => score.modified_at,
                });
                score.weighted()
            }
            None => (0.0, block.weighted_possible()),
        };
        earned_all += earned;
        possible_all += possible;
        records.push(BlockRecord {
            locator: block.usage_key.clone(),
            weight: block.weight,
            raw_possible: block.possible,
            graded: subsection.graded,
        });
    }

    let (earned_graded, possible_graded) = if subsection.graded {
        (earned_all, possible_all)
    } else {
        (0.0, 0.0)
    };

    ComputedSubsection {
        earned_all,
        possible_all,
        earned_graded,
        possible_graded,
        first_attempted,
        visible_blocks: VisibleBlocks::new(subsection.usage_key.course_key().clone(), records),
    }
}

/// Effective subsection values, persisted or not
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsectionScore {
    pub subsection_id: UsageKey,
    pub earned_all: f64,
    pub possible_all: f64,
    pub earned_graded: f64,
    pub possible_graded: f64,
    pub first_attempted: Option<DateTime<Utc>>,
    pub overridden: bool,
    /// Id of the persisted row, if there is one
    pub grade_id: Option<i64>,
}

impl SubsectionScore {
    pub fn attempted(&self) -> bool {
        self.first_attempted.is_some()
    }

    pub fn percent_graded(&self) -> f64 {
        crate::stores::subsection_grades::percent(self.earned_graded, self.possible_graded)
    }

    pub fn percent_all(&self) -> f64 {
        crate::stores::subsection_grades::percent(self.earned_all, self.possible_all)
    }
}

impl From<&SubsectionGradeRow> for SubsectionScore {
    fn from(row: &SubsectionGradeRow) -> Self {
        Self {
            subsection_id: row.subsection_id.clone(),
            earned_all: row.earned_all,
            possible_all: row.possible_all,
            earned_graded: row.earned_graded,
            possible_graded: row.possible_graded,
            first_attempted: row.first_attempted,
            overridden: row.overridden,
            grade_id: Some(row.id),
        }
    }
}

fn overlay(
    subsection_id: &UsageKey,
    computed: &ComputedSubsection,
    active: Option<&SubsectionOverride>,
) -> SubsectionScore {
    let (earned_all, possible_all, earned_graded, possible_graded) = match active {
        Some(o) => apply_fields(
            &o.fields,
            computed.earned_all,
            computed.possible_all,
            computed.earned_graded,
            computed.possible_graded,
        ),
        None => (
            computed.earned_all,
            computed.possible_all,
            computed.earned_graded,
            computed.possible_graded,
        ),
    };
    // An override counts as an attempt
    let first_attempted = computed
        .first_attempted
        .or_else(|| active.map(|o| o.created_at));
    SubsectionScore {
        subsection_id: subsection_id.clone(),
        earned_all,
        possible_all,
        earned_graded,
        possible_graded,
        first_attempted,
        overridden: active.is_some(),
        grade_id: None,
    }
}

#[derive(Clone)]
pub struct SubsectionGradeEngine {
    pool: SqlitePool,
    scores: ScoreStore,
    grades: SubsectionGradeStore,
    bus: EventBus,
    max_lock_wait_ms: u64,
}

impl SubsectionGradeEngine {
    pub fn new(pool: SqlitePool, bus: EventBus, max_lock_wait_ms: u64) -> Self {
        Self {
            scores: ScoreStore::new(pool.clone(), max_lock_wait_ms),
            grades: SubsectionGradeStore::new(pool.clone()),
            pool,
            bus,
            max_lock_wait_ms,
        }
    }

    async fn learner_scores<'a>(
        &self,
        ctx: &'a GradeContext,
        learner_id: LearnerId,
    ) -> Result<Cow<'a, HashMap<UsageKey, BlockScore>>> {
        match ctx.scores(learner_id) {
            Some(scores) => Ok(Cow::Borrowed(scores)),
            None => Ok(Cow::Owned(self.scores.for_learner(learner_id, ctx.course_key()).await?)),
        }
    }

    fn subsection<'a>(ctx: &'a GradeContext, subsection_id: &UsageKey) -> Result<&'a SubsectionInfo> {
        ctx.view()
            .subsection(subsection_id)
            .ok_or_else(|| unknown_subsection(subsection_id))
    }

    /// Recompute and persist one subsection grade, then emit
    /// `SubsectionGradeChanged`
    pub async fn compute(
        &self,
        ctx: &GradeContext,
        learner_id: LearnerId,
        subsection_id: &UsageKey,
        event_transaction_id: Uuid,
    ) -> Result<SubsectionGradeRow> {
        let subsection = Self::subsection(ctx, subsection_id)?;
        let scores = self.learner_scores(ctx, learner_id).await?;
        let computed = aggregate(subsection, &scores);

        let row = retry_on_lock("subsection grade write", self.max_lock_wait_ms, || {
            self.persist_once(ctx, learner_id, subsection, &computed)
        })
        .await?;

        debug!(
            learner_id,
            subsection = %row.subsection_id,
            earned_graded = row.earned_graded,
            possible_graded = row.possible_graded,
            overridden = row.overridden,
            "Subsection grade persisted"
        );

        self.bus.emit_lossy(GradeEvent::SubsectionGradeChanged {
            event_transaction_id,
            learner_id,
            course_id: row.course_id.clone(),
            subsection_id: row.subsection_id.clone(),
            earned_all: row.earned_all,
            possible_all: row.possible_all,
            earned_graded: row.earned_graded,
            possible_graded: row.possible_graded,
            first_attempted_at: row.first_attempted,
            visible_blocks_hash: row.visible_blocks_hash.clone(),
            version: row.course_version.clone(),
            edited_at: row.subsection_edited_at,
            overridden: row.overridden,
            timestamp: time::now(),
        });
        Ok(row)
    }

    async fn persist_once(
        &self,
        ctx: &GradeContext,
        learner_id: LearnerId,
        subsection: &SubsectionInfo,
        computed: &ComputedSubsection,
    ) -> Result<SubsectionGradeRow> {
        let mut tx = self.pool.begin().await?;
        let hash = VisibleBlocksStore::ensure_in_tx(&mut tx, &computed.visible_blocks).await?;

        let existing = SubsectionGradeStore::get_in_tx(&mut tx, learner_id, &subsection.usage_key).await?;
        let active = match &existing {
            Some(row) => OverrideStore::active_in_tx(&mut tx, row.id).await?,
            None => None,
        };
        let effective = overlay(&subsection.usage_key, computed, active.as_ref());

        let row = SubsectionGradeStore::upsert_in_tx(
            &mut tx,
            &SubsectionGradeWrite {
                learner_id,
                course_id: ctx.course_key().clone(),
                subsection_id: subsection.usage_key.clone(),
                course_version: ctx.view().content_version.clone(),
                subsection_edited_at: subsection.edited_at,
                earned_all: effective.earned_all,
                possible_all: effective.possible_all,
                earned_graded: effective.earned_graded,
                possible_graded: effective.possible_graded,
                first_attempted: effective.first_attempted,
                visible_blocks_hash: hash,
                overridden: effective.overridden,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Persisted grade, recomputed when absent or older than the structure
    pub async fn ensure(
        &self,
        ctx: &GradeContext,
        learner_id: LearnerId,
        subsection_id: &UsageKey,
        event_transaction_id: Uuid,
    ) -> Result<SubsectionGradeRow> {
        let prefetched = ctx
            .subsection_grades(learner_id)
            .and_then(|m| m.get(&subsection_id.normalized()))
            .cloned();
        let existing = match prefetched {
            Some(row) => Some(row),
            None => self.grades.get(learner_id, subsection_id).await?,
        };
        let subsection = Self::subsection(ctx, subsection_id)?;
        match existing {
            Some(row)
                if row.subsection_edited_at == subsection.edited_at
                    && row.course_version == ctx.view().content_version =>
            {
                Ok(row)
            }
            _ => self.compute(ctx, learner_id, subsection_id, event_transaction_id).await,
        }
    }

    /// Effective values without writing: the persisted row when present,
    /// otherwise a fresh aggregate
    pub async fn preview(
        &self,
        ctx: &GradeContext,
        learner_id: LearnerId,
        subsection_id: &UsageKey,
        persisted: Option<&SubsectionGradeRow>,
        scores: Option<&HashMap<UsageKey, BlockScore>>,
    ) -> Result<SubsectionScore> {
        if let Some(row) = persisted {
            return Ok(SubsectionScore::from(row));
        }
        let subsection = Self::subsection(ctx, subsection_id)?;
        let computed = match scores {
            Some(scores) => aggregate(subsection, scores),
            None => aggregate(subsection, &*self.learner_scores(ctx, learner_id).await?),
        };
        Ok(overlay(&subsection.usage_key, &computed, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::scores::test_support::change;
    use crate::structure::test_support::{key, problem, two_homeworks};
    use grades_common::db::init_memory_database;
    use std::sync::Arc;

    fn score(block: &UsageKey, earned: f64, possible: f64, weight: Option<f64>) -> BlockScore {
        BlockScore {
            learner_id: 1,
            block_id: block.clone(),
            course_id: block.course_key().clone(),
            raw_earned: earned,
            raw_possible: possible,
            weight,
            source: grades_common::events::ScoreSource::BlockState,
            modified_at: time::now(),
            deleted: false,
            grader_response: None,
        }
    }

    #[test]
    fn test_aggregate_missing_block_counts_possible() {
        let mut view = two_homeworks();
        view.subsections[0].blocks.push(problem("p9", 5.0));
        let subsection = &view.subsections[0];

        let scores: HashMap<_, _> = [(key("problem", "p1"), score(&key("problem", "p1"), 8.0, 10.0, None))]
            .into_iter()
            .collect();
        let computed = aggregate(subsection, &scores);

        assert_eq!(computed.earned_all, 8.0);
        assert_eq!(computed.possible_all, 15.0);
        assert_eq!(computed.earned_graded, 8.0);
        assert!(computed.first_attempted.is_some());
        assert_eq!(computed.visible_blocks.blocks.len(), 2);
    }

    #[test]
    fn test_aggregate_applies_weights_and_ignores_deleted() {
        let mut view = two_homeworks();
        view.subsections[0].blocks[0].weight = Some(2.0);
        let p1 = key("problem", "p1");

        let weighted: HashMap<_, _> = [(p1.clone(), score(&p1, 5.0, 10.0, Some(2.0)))].into_iter().collect();
        let computed = aggregate(&view.subsections[0], &weighted);
        assert_eq!((computed.earned_all, computed.possible_all), (1.0, 2.0));

        let mut deleted = score(&p1, 0.0, 0.0, Some(2.0));
        deleted.deleted = true;
        let reset: HashMap<_, _> = [(p1, deleted)].into_iter().collect();
        let computed = aggregate(&view.subsections[0], &reset);
        assert_eq!((computed.earned_all, computed.possible_all), (0.0, 2.0));
        assert!(computed.first_attempted.is_none());
    }

    #[test]
    fn test_ungraded_subsection_has_no_graded_points() {
        let mut view = two_homeworks();
        view.subsections[0].graded = false;
        let p1 = key("problem", "p1");
        let scores: HashMap<_, _> = [(p1.clone(), score(&p1, 5.0, 10.0, None))].into_iter().collect();
        let computed = aggregate(&view.subsections[0], &scores);
        assert_eq!((computed.earned_graded, computed.possible_graded), (0.0, 0.0));
        assert_eq!(computed.earned_all, 5.0);
    }

    #[tokio::test]
    async fn test_compute_persists_and_emits() {
        let pool = init_memory_database().await.unwrap();
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let engine = SubsectionGradeEngine::new(pool.clone(), bus, 1000);
        let scores = ScoreStore::new(pool.clone(), 1000);
        scores
            .upsert(&change(1, &key("problem", "p1"), 6.0, 10.0, time::now()))
            .await
            .unwrap();

        let ctx = GradeContext::new(Arc::new(two_homeworks())).unwrap();
        let txn = Uuid::new_v4();
        let row = engine.compute(&ctx, 1, &key("sequential", "hw1"), txn).await.unwrap();
        assert_eq!((row.earned_graded, row.possible_graded), (6.0, 10.0));
        assert!(row.attempted());

        match rx.recv().await.unwrap() {
            GradeEvent::SubsectionGradeChanged {
                event_transaction_id,
                earned_graded,
                visible_blocks_hash,
                ..
            } => {
                assert_eq!(event_transaction_id, txn);
                assert_eq!(earned_graded, 6.0);
                assert_eq!(visible_blocks_hash, row.visible_blocks_hash);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Unattempted subsection is synthesized with structure-derived possible
        let synthesized = engine.ensure(&ctx, 1, &key("sequential", "hw2"), txn).await.unwrap();
        assert_eq!((synthesized.earned_graded, synthesized.possible_graded), (0.0, 10.0));
        assert!(!synthesized.attempted());
    }

    #[tokio::test]
    async fn test_unknown_subsection_is_structure_unavailable() {
        let pool = init_memory_database().await.unwrap();
        let engine = SubsectionGradeEngine::new(pool, EventBus::new(4), 1000);
        let ctx = GradeContext::new(Arc::new(two_homeworks())).unwrap();
        let err = engine
            .compute(&ctx, 1, &key("sequential", "missing"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "structure_unavailable");
    }
}
