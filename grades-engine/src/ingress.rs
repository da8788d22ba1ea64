//! Score ingress
//!
//! Normalizes block-state and submission events into `WeightedScoreChanged`.
//! Unknown anonymous handles and zero-possible submissions are dropped with a
//! warning rather than failing the caller.

use crate::directory::LearnerDirectory;
use crate::error::{GradesError, Result};
use crate::stores::scores::{validate_score, weighted_score};
use crate::structure::CourseStructure;
use chrono::{DateTime, Utc};
use grades_common::events::{ScoreSource, WeightedScoreChanged};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A block-state score as published by the content runtime
#[derive(Debug, Clone, PartialEq)]
pub struct BlockScoreInput {
    pub learner_id: LearnerId,
    pub block_id: UsageKey,
    pub raw_earned: f64,
    pub raw_possible: f64,
    pub weight: Option<f64>,
    pub only_if_higher: bool,
    pub modified_at: DateTime<Utc>,
    pub deleted: bool,
    pub grader_response: Option<String>,
}

#[derive(Clone)]
pub struct ScoreIngress {
    structure: Arc<dyn CourseStructure>,
    directory: Arc<dyn LearnerDirectory>,
}

impl ScoreIngress {
    pub fn new(structure: Arc<dyn CourseStructure>, directory: Arc<dyn LearnerDirectory>) -> Self {
        Self {
            structure,
            directory,
        }
    }

    /// Weight advertised by the course structure, if the block is known
    async fn structure_weight(&self, block: &UsageKey) -> Option<f64> {
        match self.structure.snapshot(block.course_key()).await {
            Ok(view) => view.block(block).and_then(|b| b.weight),
            Err(e) => {
                debug!(block = %block, error = %e, "No structure for weight lookup");
                None
            }
        }
    }

    pub async fn from_block_score(
        &self,
        input: BlockScoreInput,
        event_transaction_id: Uuid,
    ) -> Result<WeightedScoreChanged> {
        let block_id = input.block_id.normalized();
        let weight = match input.weight {
            Some(w) => Some(w),
            None => self.structure_weight(&block_id).await,
        };

        let (raw_earned, raw_possible) = if input.deleted {
            (0.0, 0.0)
        } else {
            validate_score(input.raw_earned, input.raw_possible, weight)?;
            (input.raw_earned, input.raw_possible)
        };
        let (weighted_earned, weighted_possible) = weighted_score(raw_earned, raw_possible, weight);

        Ok(WeightedScoreChanged {
            event_transaction_id,
            learner_id: input.learner_id,
            course_id: block_id.course_key().clone(),
            block_id,
            weighted_earned,
            weighted_possible,
            raw_earned,
            raw_possible,
            weight,
            source: ScoreSource::BlockState,
            modified_at: time::truncate(input.modified_at),
            only_if_higher: input.only_if_higher,
            deleted: input.deleted,
            grader_response: input.grader_response,
        })
    }

    async fn resolve(&self, anonymous_user_id: &str) -> Result<Option<LearnerId>> {
        let learner = self.directory.resolve_anonymous(anonymous_user_id).await?;
        if learner.is_none() {
            let err = GradesError::UnknownLearner(anonymous_user_id.to_string());
            warn!(code = err.code(), "{}", err);
        }
        Ok(learner)
    }

    fn submission_block(course_id: &CourseKey, item_id: &UsageKey) -> Result<UsageKey> {
        let block = item_id.normalized();
        if block.course_key() != &course_id.normalized() {
            return Err(GradesError::InvalidScore(format!(
                "Item {} is not in course {}",
                item_id, course_id
            )));
        }
        Ok(block)
    }

    /// A submissions score was set; `None` when the event is dropped
    #[allow(clippy::too_many_arguments)]
    pub async fn from_submission_set(
        &self,
        anonymous_user_id: &str,
        course_id: &CourseKey,
        item_id: &UsageKey,
        points_earned: f64,
        points_possible: f64,
        modified_at: DateTime<Utc>,
        event_transaction_id: Uuid,
    ) -> Result<Option<WeightedScoreChanged>> {
        let block_id = Self::submission_block(course_id, item_id)?;
        let Some(learner_id) = self.resolve(anonymous_user_id).await? else {
            return Ok(None);
        };
        if points_possible == 0.0 {
            let err = GradesError::ZeroPossible(block_id.to_string());
            warn!(code = err.code(), learner_id, "{}", err);
            return Ok(None);
        }

        let weight = self.structure_weight(&block_id).await;
        validate_score(points_earned, points_possible, weight)?;
        let (weighted_earned, weighted_possible) = weighted_score(points_earned, points_possible, weight);

        Ok(Some(WeightedScoreChanged {
            event_transaction_id,
            learner_id,
            course_id: block_id.course_key().clone(),
            block_id,
            weighted_earned,
            weighted_possible,
            raw_earned: points_earned,
            raw_possible: points_possible,
            weight,
            source: ScoreSource::Submissions,
            modified_at: time::truncate(modified_at),
            only_if_higher: false,
            deleted: false,
            grader_response: None,
        }))
    }

    /// A submissions score was reset; yields a deleted zero score
    pub async fn from_submission_reset(
        &self,
        anonymous_user_id: &str,
        course_id: &CourseKey,
        item_id: &UsageKey,
        modified_at: DateTime<Utc>,
        event_transaction_id: Uuid,
    ) -> Result<Option<WeightedScoreChanged>> {
        let block_id = Self::submission_block(course_id, item_id)?;
        let Some(learner_id) = self.resolve(anonymous_user_id).await? else {
            return Ok(None);
        };
        let weight = self.structure_weight(&block_id).await;

        Ok(Some(WeightedScoreChanged {
            event_transaction_id,
            learner_id,
            course_id: block_id.course_key().clone(),
            block_id,
            weighted_earned: 0.0,
            weighted_possible: 0.0,
            raw_earned: 0.0,
            raw_possible: 0.0,
            weight,
            source: ScoreSource::Submissions,
            modified_at: time::truncate(modified_at),
            only_if_higher: false,
            deleted: true,
            grader_response: None,
        }))
    }
}
