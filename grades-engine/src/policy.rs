//! Grading policy evaluation
//!
//! Pure functions: no I/O, no clocks. A policy is an ordered list of
//! assignment types plus letter cutoffs; evaluation turns per-subsection
//! percentages into a course percent, letter and pass flag.

use crate::error::{GradesError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance on the sum of assignment type weights
const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentType {
    pub name: String,
    pub weight: f64,
    pub min_count: u32,
    #[serde(default)]
    pub drop_count: u32,
    #[serde(default)]
    pub short_label: String,
    /// Minimum type average required to pass, in addition to the course cutoff
    #[serde(default)]
    pub passing_grade: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingPolicy {
    pub assignment_types: Vec<AssignmentType>,
    /// letter -> minimum percent in [0, 1]
    pub grade_cutoffs: BTreeMap<String, f64>,
    /// Explicit pass threshold; defaults to the lowest letter cutoff
    #[serde(default)]
    pub passing_cutoff: Option<f64>,
}

/// One graded subsection's contribution to evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct SubsectionPercent {
    pub assignment_type: String,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeBreakdown {
    pub name: String,
    pub short_label: String,
    /// Drop-aware average over `min_count`
    pub average: f64,
    /// `weight * average`
    pub contribution: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyResult {
    pub percent: f64,
    pub letter_grade: Option<String>,
    pub passed: bool,
    pub breakdown: Vec<TypeBreakdown>,
}

impl GradingPolicy {
    /// Parse and validate a policy from JSON
    pub fn from_json(text: &str) -> Result<Self> {
        let policy: GradingPolicy = serde_json::from_str(text)
            .map_err(|e| GradesError::InvalidPolicy(format!("Malformed policy JSON: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.assignment_types.is_empty() {
            return Err(GradesError::InvalidPolicy("No assignment types".into()));
        }

        let mut total = 0.0;
        let mut seen = std::collections::HashSet::new();
        for t in &self.assignment_types {
            if !seen.insert(t.name.as_str()) {
                return Err(GradesError::InvalidPolicy(format!(
                    "Duplicate assignment type '{}'",
                    t.name
                )));
            }
            if !(t.weight.is_finite() && t.weight >= 0.0) {
                return Err(GradesError::InvalidPolicy(format!(
                    "Assignment type '{}' has invalid weight {}",
                    t.name, t.weight
                )));
            }
            if t.drop_count >= t.min_count {
                return Err(GradesError::InvalidPolicy(format!(
                    "Assignment type '{}': drop_count {} must be below min_count {}",
                    t.name, t.drop_count, t.min_count
                )));
            }
            if let Some(p) = t.passing_grade {
                check_unit("passing_grade", p)?;
            }
            total += t.weight;
        }
        if (total - 1.0).abs() > WEIGHT_EPSILON {
            return Err(GradesError::InvalidPolicy(format!(
                "Assignment type weights sum to {}, expected 1.0",
                total
            )));
        }

        for (letter, cutoff) in &self.grade_cutoffs {
            check_unit(&format!("cutoff for '{}'", letter), *cutoff)?;
        }
        if let Some(p) = self.passing_cutoff {
            check_unit("passing_cutoff", p)?;
        }
        if self.grade_cutoffs.is_empty() && self.passing_cutoff.is_none() {
            return Err(GradesError::InvalidPolicy(
                "Policy needs a letter cutoff or a passing_cutoff".into(),
            ));
        }
        Ok(())
    }

    pub fn assignment_type(&self, name: &str) -> Option<&AssignmentType> {
        self.assignment_types.iter().find(|t| t.name == name)
    }

    /// Threshold at or above which a course percent passes
    pub fn passing_threshold(&self) -> f64 {
        self.passing_cutoff.unwrap_or_else(|| {
            self.grade_cutoffs
                .values()
                .copied()
                .fold(f64::INFINITY, f64::min)
        })
    }

    /// Letter for a percent: the highest cutoff not above it; equal cutoffs
    /// resolve to the alphabetically first letter
    pub fn letter_for(&self, percent: f64) -> Option<String> {
        self.grade_cutoffs
            .iter()
            .filter(|(_, cutoff)| **cutoff <= percent)
            .max_by(|(la, ca), (lb, cb)| ca.total_cmp(cb).then_with(|| lb.cmp(la)))
            .map(|(letter, _)| letter.clone())
    }

    /// Evaluate per-subsection percentages
    ///
    /// Subsections whose assignment type is not in the policy are ignored.
    pub fn evaluate(&self, grades: &[SubsectionPercent]) -> PolicyResult {
        let mut breakdown = Vec::with_capacity(self.assignment_types.len());
        let mut total = 0.0;
        let mut type_gate_passed = true;

        for t in &self.assignment_types {
            let values: Vec<f64> = grades
                .iter()
                .filter(|g| g.assignment_type == t.name)
                .map(|g| g.percent)
                .collect();
            let average = type_average(t, &values);
            let contribution = t.weight * average;
            total += contribution;

            if let Some(required) = t.passing_grade {
                if average < required {
                    type_gate_passed = false;
                }
            }

            breakdown.push(TypeBreakdown {
                name: t.name.clone(),
                short_label: t.short_label.clone(),
                average,
                contribution,
                count: values.len(),
            });
        }

        let percent = total.clamp(0.0, 1.0);
        let letter_grade = self.letter_for(percent);
        let passed = type_gate_passed && percent >= self.passing_threshold();

        PolicyResult {
            percent,
            letter_grade,
            passed,
            breakdown,
        }
    }

    /// base64(SHA-256) of the canonical JSON form
    pub fn policy_hash(&self) -> Result<String> {
        let (_, digest) = grades_common::digest::hash_canonical(self)?;
        Ok(digest)
    }
}

/// Drop-aware average of one assignment type
///
/// Values are clamped to [0, 1] and padded with zeros up to `min_count`
/// (missing slots count as zero), sorted descending, the lowest `drop_count`
/// are removed, and the remainder is averaged over `max(min_count, kept)`.
pub fn type_average(t: &AssignmentType, values: &[f64]) -> f64 {
    let mut scores: Vec<f64> = values.iter().map(|v| v.clamp(0.0, 1.0)).collect();
    while scores.len() < t.min_count as usize {
        scores.push(0.0);
    }
    scores.sort_by(|a, b| b.total_cmp(a));
    let keep = scores.len().saturating_sub(t.drop_count as usize);
    scores.truncate(keep);

    let denominator = (t.min_count as usize).max(scores.len());
    if denominator == 0 {
        return 0.0;
    }
    scores.iter().sum::<f64>() / denominator as f64
}

fn check_unit(what: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(GradesError::InvalidPolicy(format!(
            "{} must be within [0, 1], got {}",
            what, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn homework(min_count: u32, drop_count: u32) -> AssignmentType {
        AssignmentType {
            name: "Homework".into(),
            weight: 1.0,
            min_count,
            drop_count,
            short_label: "HW".into(),
            passing_grade: None,
        }
    }

    fn policy(types: Vec<AssignmentType>, cutoffs: &[(&str, f64)]) -> GradingPolicy {
        GradingPolicy {
            assignment_types: types,
            grade_cutoffs: cutoffs.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
            passing_cutoff: None,
        }
    }

    fn hw(percent: f64) -> SubsectionPercent {
        SubsectionPercent {
            assignment_type: "Homework".into(),
            percent,
        }
    }

    #[test]
    fn test_simple_pass() {
        let p = policy(vec![homework(2, 0)], &[("Pass", 0.5)]);
        p.validate().unwrap();
        let result = p.evaluate(&[hw(0.8), hw(0.2)]);
        assert_eq!(result.percent, 0.5);
        assert!(result.passed);
        assert_eq!(result.letter_grade.as_deref(), Some("Pass"));
    }

    #[test]
    fn test_drop_lowest_averages_over_min_count() {
        let p = policy(vec![homework(3, 1)], &[("Pass", 0.5)]);
        let result = p.evaluate(&[hw(1.0), hw(0.0), hw(0.5)]);
        assert!((result.percent - 1.5 / 3.0).abs() < 1e-9);
        assert!(result.passed);
    }

    #[test]
    fn test_missing_slots_count_as_zero() {
        let p = policy(vec![homework(4, 0)], &[("Pass", 0.5)]);
        let result = p.evaluate(&[hw(1.0)]);
        assert!((result.percent - 0.25).abs() < 1e-9);
        assert!(!result.passed);
        assert!(result.letter_grade.is_none());
    }

    #[test]
    fn test_more_subsections_than_min_count() {
        let p = policy(vec![homework(2, 1)], &[("Pass", 0.5)]);
        // Four values, lowest dropped, three kept: average over 3
        let result = p.evaluate(&[hw(0.9), hw(0.6), hw(0.3), hw(0.0)]);
        assert!((result.percent - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_types_sum() {
        let mut exam = homework(1, 0);
        exam.name = "Exam".into();
        exam.weight = 0.4;
        let mut hwk = homework(2, 0);
        hwk.weight = 0.6;
        let p = policy(vec![hwk, exam], &[("A", 0.9), ("B", 0.7), ("C", 0.5)]);
        p.validate().unwrap();

        let grades = vec![
            hw(1.0),
            hw(0.5),
            SubsectionPercent {
                assignment_type: "Exam".into(),
                percent: 0.75,
            },
        ];
        let result = p.evaluate(&grades);
        let expected = 0.6 * 0.75 + 0.4 * 0.75;
        assert!((result.percent - expected).abs() < 1e-9);
        assert_eq!(result.letter_grade.as_deref(), Some("B"));
        assert_eq!(result.breakdown.len(), 2);
        assert_eq!(result.breakdown[0].count, 2);
    }

    #[test]
    fn test_unknown_types_ignored() {
        let p = policy(vec![homework(1, 0)], &[("Pass", 0.5)]);
        let result = p.evaluate(&[SubsectionPercent {
            assignment_type: "Lab".into(),
            percent: 1.0,
        }]);
        assert_eq!(result.percent, 0.0);
    }

    #[test]
    fn test_cutoff_ties_resolve_to_higher_letter() {
        let p = policy(vec![homework(1, 0)], &[("A", 0.8), ("B", 0.8), ("C", 0.6)]);
        assert_eq!(p.letter_for(0.85).as_deref(), Some("A"));
        assert_eq!(p.letter_for(0.7).as_deref(), Some("C"));
        assert_eq!(p.letter_for(0.1), None);
    }

    #[test]
    fn test_passing_cutoff_override() {
        let mut p = policy(vec![homework(1, 0)], &[("A", 0.9), ("Pass", 0.5)]);
        p.passing_cutoff = Some(0.7);
        assert!(!p.evaluate(&[hw(0.6)]).passed);
        assert!(p.evaluate(&[hw(0.7)]).passed);
    }

    #[test]
    fn test_type_passing_grade_gates_pass() {
        let mut exam = homework(1, 0);
        exam.name = "Exam".into();
        exam.weight = 0.5;
        exam.passing_grade = Some(0.6);
        let mut hwk = homework(1, 0);
        hwk.weight = 0.5;
        let p = policy(vec![hwk, exam], &[("Pass", 0.5)]);

        let result = p.evaluate(&[
            hw(1.0),
            SubsectionPercent {
                assignment_type: "Exam".into(),
                percent: 0.5,
            },
        ]);
        assert!(result.percent >= 0.5);
        assert!(!result.passed);
    }

    #[test]
    fn test_validation_rejects_bad_policies() {
        assert!(policy(vec![homework(2, 2)], &[("Pass", 0.5)]).validate().is_err());
        let mut light = homework(1, 0);
        light.weight = 0.5;
        assert!(policy(vec![light], &[("Pass", 0.5)]).validate().is_err());
        assert!(policy(vec![homework(1, 0)], &[]).validate().is_err());
        assert!(policy(vec![homework(1, 0)], &[("A", 1.5)]).validate().is_err());
        assert!(policy(vec![homework(1, 0), homework(1, 0)], &[("A", 0.5)])
            .validate()
            .is_err());
    }

    #[test]
    fn test_percent_clamped() {
        let p = policy(vec![homework(1, 0)], &[("Pass", 0.5)]);
        assert_eq!(p.evaluate(&[hw(3.0)]).percent, 1.0);
    }

    #[test]
    fn test_policy_hash_stable_and_sensitive() {
        let a = policy(vec![homework(2, 0)], &[("Pass", 0.5)]);
        let b = a.clone();
        assert_eq!(a.policy_hash().unwrap(), b.policy_hash().unwrap());

        let mut c = a.clone();
        c.grade_cutoffs.insert("Pass".into(), 0.6);
        assert_ne!(a.policy_hash().unwrap(), c.policy_hash().unwrap());
    }

    #[test]
    fn test_from_json() {
        let p = GradingPolicy::from_json(
            r#"{"assignment_types":[{"name":"Homework","weight":1.0,"min_count":2}],
                "grade_cutoffs":{"Pass":0.5}}"#,
        )
        .unwrap();
        assert_eq!(p.assignment_types[0].drop_count, 0);
        assert!(GradingPolicy::from_json("{}").is_err());
    }
}
