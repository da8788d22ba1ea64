//! Learner filters shared by reports and gradebook reads

use crate::context::GradeContext;
use crate::directory::EnrolledLearner;
use crate::engine::SubsectionScore;
use crate::stores::CourseGradeRow;
use grades_common::{LearnerId, UsageKey};
use serde::{Deserialize, Serialize};

/// Graded percent range on one subsection, in percent points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRange {
    pub subsection_id: UsageKey,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFilter {
    /// Case-insensitive substring of username or email
    #[serde(default)]
    pub user_contains: Option<String>,
    #[serde(default)]
    pub cohort: Option<String>,
    #[serde(default)]
    pub enrollment_mode: Option<String>,
    #[serde(default)]
    pub assignment: Option<AssignmentRange>,
    /// Course percent range in percent points
    #[serde(default)]
    pub course_grade_min: Option<f64>,
    #[serde(default)]
    pub course_grade_max: Option<f64>,
}

fn in_range(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    value >= min.unwrap_or(0.0) && value <= max.unwrap_or(100.0)
}

/// Absent rows pass only when the lower bound is open
fn open_below(min: Option<f64>) -> bool {
    min.map_or(true, |m| m <= 0.0)
}

impl ReportFilter {
    pub fn is_empty(&self) -> bool {
        self == &ReportFilter::default()
    }

    /// Whether grade data is needed to decide membership
    pub fn needs_grades(&self) -> bool {
        self.assignment.is_some() || self.course_grade_min.is_some() || self.course_grade_max.is_some()
    }

    /// Identity and enrollment checks; no grade data needed
    pub fn matches_enrollment(&self, learner: &EnrolledLearner) -> bool {
        if let Some(needle) = &self.user_contains {
            let needle = needle.to_lowercase();
            let hit = learner.learner.username.to_lowercase().contains(&needle)
                || learner.learner.email.to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        if let Some(cohort) = &self.cohort {
            if learner.enrollment.cohort.as_deref() != Some(cohort.as_str()) {
                return false;
            }
        }
        if let Some(mode) = &self.enrollment_mode {
            if &learner.enrollment.mode != mode {
                return false;
            }
        }
        true
    }

    /// Grade range checks over persisted rows
    ///
    /// `subsection` is the effective grade of the filtered subsection, when
    /// one is persisted.
    pub fn matches_grades(
        &self,
        subsection: Option<&SubsectionScore>,
        course_grade: Option<&CourseGradeRow>,
    ) -> bool {
        if let Some(range) = &self.assignment {
            let ok = match subsection {
                Some(score) => in_range(score.percent_graded() * 100.0, range.min, range.max),
                None => open_below(range.min),
            };
            if !ok {
                return false;
            }
        }
        if self.course_grade_min.is_some() || self.course_grade_max.is_some() {
            let ok = match course_grade {
                Some(row) => in_range(
                    row.percent_grade * 100.0,
                    self.course_grade_min,
                    self.course_grade_max,
                ),
                None => open_below(self.course_grade_min),
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Grade range checks against rows prefetched into `ctx`
    pub fn matches_context(&self, ctx: &GradeContext, learner_id: LearnerId) -> bool {
        if !self.needs_grades() {
            return true;
        }
        let assignment = self
            .assignment
            .as_ref()
            .and_then(|range| ctx.subsection_grades(learner_id)?.get(&range.subsection_id.normalized()))
            .map(SubsectionScore::from);
        self.matches_grades(assignment.as_ref(), ctx.course_grade(learner_id).flatten())
    }
}
