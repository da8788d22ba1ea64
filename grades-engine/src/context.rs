//! Per-computation grade context
//!
//! Holds one structure snapshot plus optional bulk-prefetched rows, so a
//! batch of learners can be graded without a query per learner.

use crate::error::Result;
use crate::stores::{BlockScore, CourseGradeRow, GradeStores, SubsectionGradeRow};
use crate::structure::{CourseStructure, CourseStructureView};
use grades_common::{CourseKey, LearnerId, UsageKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct GradeContext {
    view: Arc<CourseStructureView>,
    policy_hash: String,
    prefetched: HashSet<LearnerId>,
    scores: HashMap<LearnerId, HashMap<UsageKey, BlockScore>>,
    subsection_grades: HashMap<LearnerId, HashMap<UsageKey, SubsectionGradeRow>>,
    course_grades: HashMap<LearnerId, CourseGradeRow>,
}

impl GradeContext {
    pub fn new(view: Arc<CourseStructureView>) -> Result<Self> {
        let policy_hash = view.grading_policy.policy_hash()?;
        Ok(Self {
            view,
            policy_hash,
            prefetched: HashSet::new(),
            scores: HashMap::new(),
            subsection_grades: HashMap::new(),
            course_grades: HashMap::new(),
        })
    }

    /// Snapshot the course and build an empty context
    pub async fn load(structure: &dyn CourseStructure, course: &CourseKey) -> Result<Self> {
        Self::new(structure.snapshot(course).await?)
    }

    pub fn view(&self) -> &Arc<CourseStructureView> {
        &self.view
    }

    pub fn course_key(&self) -> &CourseKey {
        &self.view.course_key
    }

    pub fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    /// Load scores and grades for a batch of learners
    ///
    /// Replaces anything previously prefetched. Overrides are already folded
    /// into the persisted subsection rows.
    pub async fn prefetch(&mut self, stores: &GradeStores, learners: &[LearnerId]) -> Result<()> {
        let course = self.view.course_key.clone();
        self.scores = stores.scores.for_learners(&course, learners).await?;
        self.subsection_grades = stores.subsection_grades.for_learners(&course, learners).await?;
        self.course_grades = stores.course_grades.for_learners(&course, learners).await?;
        for learner_id in learners {
            self.scores.entry(*learner_id).or_default();
            self.subsection_grades.entry(*learner_id).or_default();
        }
        self.prefetched = learners.iter().copied().collect();
        Ok(())
    }

    pub fn is_prefetched(&self, learner_id: LearnerId) -> bool {
        self.prefetched.contains(&learner_id)
    }

    /// Prefetched scores; `None` when the learner was not prefetched
    pub fn scores(&self, learner_id: LearnerId) -> Option<&HashMap<UsageKey, BlockScore>> {
        self.scores.get(&learner_id)
    }

    pub fn subsection_grades(&self, learner_id: LearnerId) -> Option<&HashMap<UsageKey, SubsectionGradeRow>> {
        self.subsection_grades.get(&learner_id)
    }

    /// `Some(None)` when prefetched and absent
    pub fn course_grade(&self, learner_id: LearnerId) -> Option<Option<&CourseGradeRow>> {
        self.is_prefetched(learner_id)
            .then(|| self.course_grades.get(&learner_id))
    }
}
