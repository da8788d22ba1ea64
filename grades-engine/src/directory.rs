//! Learner directory port
//!
//! Resolves anonymous submission handles and enumerates course enrollments
//! in learner-id order so report jobs can page and checkpoint.

use crate::error::{GradesError, Result};
use async_trait::async_trait;
use grades_common::{CourseKey, LearnerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learner {
    pub id: LearnerId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub external_user_key: Option<String>,
    /// Anonymous handles used by the submissions subsystem
    #[serde(default)]
    pub anonymous_ids: Vec<String>,
    #[serde(default)]
    pub enrollments: Vec<Enrollment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub course_id: CourseKey,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub cohort: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_mode() -> String {
    "audit".to_string()
}

fn default_active() -> bool {
    true
}

/// A learner together with one course enrollment
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledLearner {
    pub learner: Learner,
    pub enrollment: Enrollment,
}

impl EnrolledLearner {
    pub fn id(&self) -> LearnerId {
        self.learner.id
    }

    pub fn enrollment_status(&self) -> &'static str {
        if self.enrollment.is_active {
            "active"
        } else {
            "inactive"
        }
    }
}

#[async_trait]
pub trait LearnerDirectory: Send + Sync {
    async fn resolve_anonymous(&self, handle: &str) -> Result<Option<LearnerId>>;

    async fn learner(&self, id: LearnerId) -> Result<Option<Learner>>;

    /// Learners enrolled in a course with id greater than `after`, ascending
    async fn enrolled_learners(
        &self,
        course: &CourseKey,
        after: Option<LearnerId>,
        limit: usize,
    ) -> Result<Vec<EnrolledLearner>>;

    async fn count_enrolled(&self, course: &CourseKey) -> Result<u64>;

    async fn enrollment(&self, id: LearnerId, course: &CourseKey) -> Result<Option<EnrolledLearner>> {
        let course = course.normalized();
        Ok(self.learner(id).await?.and_then(|learner| {
            let enrollment = learner
                .enrollments
                .iter()
                .find(|e| e.course_id.normalized() == course)
                .cloned()?;
            Some(EnrolledLearner {
                learner,
                enrollment,
            })
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct Roster {
    learners: Vec<Learner>,
}

/// Directory backed by an in-process map, optionally loaded from a JSON roster
#[derive(Default)]
pub struct InMemoryLearnerDirectory {
    learners: RwLock<BTreeMap<LearnerId, Learner>>,
    anonymous: RwLock<HashMap<String, LearnerId>>,
}

impl InMemoryLearnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, mut learner: Learner) {
        for e in &mut learner.enrollments {
            e.course_id = e.course_id.normalized();
        }
        let mut anonymous = self.anonymous.write().await;
        for handle in &learner.anonymous_ids {
            anonymous.insert(handle.clone(), learner.id);
        }
        self.learners.write().await.insert(learner.id, learner);
    }

    /// Load `{"learners": [...]}` from a JSON file
    pub async fn load_roster(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let roster: Roster = serde_json::from_str(&text)?;
        let directory = Self::new();
        let count = roster.learners.len();
        for learner in roster.learners {
            directory.insert(learner).await;
        }
        info!(path = %path.display(), learners = count, "Loaded learner roster");
        Ok(directory)
    }
}

#[async_trait]
impl LearnerDirectory for InMemoryLearnerDirectory {
    async fn resolve_anonymous(&self, handle: &str) -> Result<Option<LearnerId>> {
        Ok(self.anonymous.read().await.get(handle).copied())
    }

    async fn learner(&self, id: LearnerId) -> Result<Option<Learner>> {
        Ok(self.learners.read().await.get(&id).cloned())
    }

    async fn enrolled_learners(
        &self,
        course: &CourseKey,
        after: Option<LearnerId>,
        limit: usize,
    ) -> Result<Vec<EnrolledLearner>> {
        if limit == 0 {
            return Err(GradesError::Common(grades_common::Error::InvalidInput(
                "Page size must be positive".into(),
            )));
        }
        let course = course.normalized();
        let learners = self.learners.read().await;
        let range = match after {
            Some(id) => learners.range((std::ops::Bound::Excluded(id), std::ops::Bound::Unbounded)),
            None => learners.range(..),
        };
        Ok(range
            .filter_map(|(_, learner)| {
                let enrollment = learner
                    .enrollments
                    .iter()
                    .find(|e| e.course_id == course)?
                    .clone();
                Some(EnrolledLearner {
                    learner: learner.clone(),
                    enrollment,
                })
            })
            .take(limit)
            .collect())
    }

    async fn count_enrolled(&self, course: &CourseKey) -> Result<u64> {
        let course = course.normalized();
        Ok(self
            .learners
            .read()
            .await
            .values()
            .filter(|l| l.enrollments.iter().any(|e| e.course_id == course))
            .count() as u64)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn learner(id: LearnerId, course: &CourseKey) -> Learner {
        Learner {
            id,
            username: format!("learner{}", id),
            email: format!("learner{}@example.com", id),
            external_user_key: None,
            anonymous_ids: vec![format!("anon-{}", id)],
            enrollments: vec![Enrollment {
                course_id: course.clone(),
                mode: "verified".into(),
                cohort: None,
                is_active: true,
            }],
        }
    }

    pub async fn directory_with(course: &CourseKey, ids: &[LearnerId]) -> InMemoryLearnerDirectory {
        let directory = InMemoryLearnerDirectory::new();
        for id in ids {
            directory.insert(learner(*id, course)).await;
        }
        directory
    }
}
