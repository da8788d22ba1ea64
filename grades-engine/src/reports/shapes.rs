//! Report kinds, column layouts and row rendering

use crate::directory::EnrolledLearner;
use crate::engine::{CourseGradeSummary, SubsectionScore};
use crate::error::{GradesError, Result};
use crate::stores::{BlockScore, CourseGradeRow, SubsectionGradeRow, VisibleBlocks};
use crate::structure::CourseStructureView;
use grades_common::{LearnerId, UsageKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const NOT_ATTEMPTED: &str = "Not Attempted";
pub const NOT_AVAILABLE: &str = "Not Available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Gradebook,
    Progress,
    Problem,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Gradebook => "gradebook",
            ReportKind::Progress => "progress",
            ReportKind::Problem => "problem",
        }
    }

    /// Base name of the uploaded files
    pub fn file_stem(&self) -> &'static str {
        match self {
            ReportKind::Gradebook => "grade_report",
            ReportKind::Progress => "progress_report",
            ReportKind::Problem => "problem_grade_report",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = GradesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gradebook" => Ok(ReportKind::Gradebook),
            "progress" => Ok(ReportKind::Progress),
            "problem" => Ok(ReportKind::Problem),
            other => Err(GradesError::Common(grades_common::Error::InvalidInput(format!(
                "Unknown report kind '{}'",
                other
            )))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Subsection(UsageKey),
    TypeAverage(String),
    Unit(UsageKey),
    BlockEarned { subsection: UsageKey, block: UsageKey },
    BlockPossible { subsection: UsageKey, block: UsageKey },
}

/// Per-learner inputs for one row
pub struct RowInput<'a> {
    pub learner: &'a EnrolledLearner,
    pub summary: &'a CourseGradeSummary,
    /// Persisted course grade; headline values come from here when present
    pub course_grade: Option<&'a CourseGradeRow>,
    /// Effective grades of every subsection, graded or not
    pub units: &'a HashMap<UsageKey, SubsectionScore>,
    pub scores: &'a HashMap<UsageKey, BlockScore>,
    pub persisted: &'a HashMap<UsageKey, SubsectionGradeRow>,
    /// Visible-block records by hash
    pub visible: &'a HashMap<String, VisibleBlocks>,
}

const GRADEBOOK_PREFIX: &[&str] = &["username", "email", "external_user_key", "course_id", "percent", "letter_grade"];
const PROGRESS_PREFIX: &[&str] = &["learner_id", "email", "username"];
const PROBLEM_PREFIX: &[&str] = &["learner_id", "email", "username", "enrollment_status", "percent"];

/// Rounded to four places, without trailing zeros
pub fn number(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    format!("{}", rounded)
}

#[derive(Debug, Clone)]
pub struct ReportLayout {
    kind: ReportKind,
    header: Vec<String>,
    columns: Vec<Column>,
}

impl ReportLayout {
    pub fn new(kind: ReportKind, view: &CourseStructureView) -> Self {
        let (prefix, columns) = match kind {
            ReportKind::Gradebook => (GRADEBOOK_PREFIX, gradebook_columns(view)),
            ReportKind::Progress => (
                PROGRESS_PREFIX,
                view.subsections()
                    .iter()
                    .map(|s| (unit_label(&s.display_name, &s.usage_key), Column::Unit(s.usage_key.clone())))
                    .collect(),
            ),
            ReportKind::Problem => (PROBLEM_PREFIX, problem_columns(view)),
        };
        let mut header: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        header.extend(columns.iter().map(|(label, _)| label.clone()));
        Self {
            kind,
            header,
            columns: columns.into_iter().map(|(_, c)| c).collect(),
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn error_header() -> Vec<String> {
        vec!["learner_id".into(), "username".into(), "error".into()]
    }

    pub fn error_row(learner_id: LearnerId, username: &str, message: &str) -> Vec<String> {
        vec![learner_id.to_string(), username.to_string(), message.to_string()]
    }

    pub fn row(&self, input: &RowInput<'_>) -> Vec<String> {
        let learner = &input.learner.learner;
        let (percent, letter_grade) = headline(input);
        let mut cells = match self.kind {
            ReportKind::Gradebook => vec![
                learner.username.clone(),
                learner.email.clone(),
                learner.external_user_key.clone().unwrap_or_default(),
                input.summary.course_id.to_string(),
                number(percent),
                letter_grade.unwrap_or_default(),
            ],
            ReportKind::Progress => vec![learner.id.to_string(), learner.email.clone(), learner.username.clone()],
            ReportKind::Problem => vec![
                learner.id.to_string(),
                learner.email.clone(),
                learner.username.clone(),
                input.learner.enrollment_status().to_string(),
                number(percent),
            ],
        };
        cells.extend(self.columns.iter().map(|c| cell(c, input)));
        cells
    }
}

/// Course percent and letter: the persisted grade, else the fresh summary
fn headline(input: &RowInput<'_>) -> (f64, Option<String>) {
    match input.course_grade {
        Some(row) => (row.percent_grade, row.letter_grade.clone()),
        None => (input.summary.result.percent, input.summary.result.letter_grade.clone()),
    }
}

fn unit_label(display_name: &str, key: &UsageKey) -> String {
    if display_name.is_empty() {
        key.block_id().to_string()
    } else {
        display_name.to_string()
    }
}

/// One column per subsection of each assignment type, plus `<type>_avg`
/// when the type has more than one
fn gradebook_columns(view: &CourseStructureView) -> Vec<(String, Column)> {
    let mut columns = Vec::new();
    for assignment_type in &view.grading_policy.assignment_types {
        let subsections: Vec<&UsageKey> = view
            .graded_subsections()
            .filter(|s| s.format.as_deref() == Some(assignment_type.name.as_str()))
            .map(|s| &s.usage_key)
            .collect();
        match subsections.as_slice() {
            [] => {}
            [only] => columns.push((assignment_type.name.clone(), Column::Subsection((*only).clone()))),
            many => {
                for (i, key) in many.iter().enumerate() {
                    columns.push((
                        format!("{}_{}", assignment_type.name, i + 1),
                        Column::Subsection((*key).clone()),
                    ));
                }
                columns.push((
                    format!("{}_avg", assignment_type.name),
                    Column::TypeAverage(assignment_type.name.clone()),
                ));
            }
        }
    }
    columns
}

/// Earned and possible columns for every block of every graded subsection
fn problem_columns(view: &CourseStructureView) -> Vec<(String, Column)> {
    let mut ordinals: HashMap<&str, usize> = HashMap::new();
    let mut columns = Vec::new();
    for subsection in view.graded_subsections() {
        let subsection_name = unit_label(&subsection.display_name, &subsection.usage_key);
        let prefix = match subsection.format.as_deref() {
            Some(format) => {
                let n = ordinals.entry(format).or_insert(0);
                *n += 1;
                format!("{} {}: {}", format, n, subsection_name)
            }
            None => subsection_name,
        };
        for block in &subsection.blocks {
            let label = format!("{} - {}", prefix, unit_label(&block.display_name, &block.usage_key));
            columns.push((
                format!("{} (Earned)", label),
                Column::BlockEarned {
                    subsection: subsection.usage_key.clone(),
                    block: block.usage_key.clone(),
                },
            ));
            columns.push((
                format!("{} (Possible)", label),
                Column::BlockPossible {
                    subsection: subsection.usage_key.clone(),
                    block: block.usage_key.clone(),
                },
            ));
        }
    }
    columns
}

fn cell(column: &Column, input: &RowInput<'_>) -> String {
    match column {
        Column::Subsection(key) => input
            .summary
            .subsections
            .iter()
            .find(|s| &s.subsection_id == key)
            .filter(|s| s.attempted() || s.overridden)
            .map(|s| number(s.percent_graded()))
            .unwrap_or_else(|| NOT_ATTEMPTED.to_string()),
        Column::TypeAverage(name) => input
            .summary
            .result
            .breakdown
            .iter()
            .find(|b| &b.name == name)
            .map(|b| number(b.average))
            .unwrap_or_else(|| number(0.0)),
        Column::Unit(key) => number(input.units.get(key).map(|s| s.percent_all()).unwrap_or(0.0)),
        Column::BlockEarned { subsection, block } => {
            block_cell(input, subsection, block).map_or_else(|m| m.to_string(), |(e, _)| number(e))
        }
        Column::BlockPossible { subsection, block } => {
            block_cell(input, subsection, block).map_or_else(|m| m.to_string(), |(_, p)| number(p))
        }
    }
}

/// Weighted (earned, possible), or the marker to print instead
fn block_cell(input: &RowInput<'_>, subsection: &UsageKey, block: &UsageKey) -> std::result::Result<(f64, f64), &'static str> {
    let visible = input
        .persisted
        .get(subsection)
        .and_then(|row| input.visible.get(&row.visible_blocks_hash));
    if let Some(visible) = visible {
        if !visible.contains(block) {
            return Err(NOT_AVAILABLE);
        }
    }
    match input.scores.get(block) {
        Some(score) if !score.deleted => Ok(score.weighted()),
        _ => Err(NOT_ATTEMPTED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::test_support::learner;
    use crate::policy::{PolicyResult, TypeBreakdown};
    use crate::stores::BlockRecord;
    use crate::structure::test_support::{course, edited, graded_subsection, homework_policy, key, problem, view};

    fn three_homeworks() -> CourseStructureView {
        let mut v = view(
            homework_policy(3, 0),
            vec![
                graded_subsection("hw1", "Homework", vec![problem("p1", 10.0)]),
                graded_subsection("hw2", "Homework", vec![problem("p2", 10.0), problem("p3", 5.0)]),
                graded_subsection("hw3", "Homework", vec![problem("p4", 10.0)]),
            ],
        );
        v.subsections[1].display_name = "Second".into();
        v
    }

    fn enrolled() -> EnrolledLearner {
        let l = learner(7, &course());
        EnrolledLearner {
            enrollment: l.enrollments[0].clone(),
            learner: l,
        }
    }

    fn sub(id: &str, earned: f64, attempted: bool) -> SubsectionScore {
        SubsectionScore {
            subsection_id: key("sequential", id),
            earned_all: earned,
            possible_all: 10.0,
            earned_graded: earned,
            possible_graded: 10.0,
            first_attempted: attempted.then(edited),
            overridden: false,
            grade_id: None,
        }
    }

    fn summary(subsections: Vec<SubsectionScore>) -> CourseGradeSummary {
        CourseGradeSummary {
            learner_id: 7,
            course_id: course(),
            result: PolicyResult {
                percent: 0.5,
                letter_grade: Some("Pass".into()),
                passed: true,
                breakdown: vec![TypeBreakdown {
                    name: "Homework".into(),
                    short_label: "HW".into(),
                    average: 0.5,
                    contribution: 0.5,
                    count: 3,
                }],
            },
            subsections,
            grading_policy_hash: "h".into(),
            course_edited_at: edited(),
        }
    }

    #[test]
    fn test_gradebook_header_numbers_multi_subsection_types() {
        let layout = ReportLayout::new(ReportKind::Gradebook, &three_homeworks());
        assert_eq!(
            layout.header(),
            &[
                "username", "email", "external_user_key", "course_id", "percent", "letter_grade",
                "Homework_1", "Homework_2", "Homework_3", "Homework_avg"
            ]
        );
    }

    #[test]
    fn test_gradebook_single_subsection_type_has_bare_column() {
        let v = view(
            homework_policy(1, 0),
            vec![graded_subsection("hw1", "Homework", vec![problem("p1", 10.0)])],
        );
        let layout = ReportLayout::new(ReportKind::Gradebook, &v);
        assert_eq!(layout.header().last().unwrap(), "Homework");
    }

    #[test]
    fn test_gradebook_row_marks_unattempted() {
        let v = three_homeworks();
        let layout = ReportLayout::new(ReportKind::Gradebook, &v);
        let learner = enrolled();
        let summary = summary(vec![sub("hw1", 10.0, true), sub("hw2", 5.0, true), sub("hw3", 0.0, false)]);
        let empty_units = HashMap::new();
        let empty_scores = HashMap::new();
        let empty_rows = HashMap::new();
        let empty_visible = HashMap::new();
        let row = layout.row(&RowInput {
            learner: &learner,
            summary: &summary,
            course_grade: None,
            units: &empty_units,
            scores: &empty_scores,
            persisted: &empty_rows,
            visible: &empty_visible,
        });
        assert_eq!(&row[..6], &["learner7", "learner7@example.com", "", "course-v1:Org+C1+R1", "0.5", "Pass"]);
        assert_eq!(&row[6..], &["1", "0.5", NOT_ATTEMPTED, "0.5"]);
    }

    #[test]
    fn test_persisted_course_grade_heads_the_row() {
        let layout = ReportLayout::new(ReportKind::Gradebook, &three_homeworks());
        let learner = enrolled();
        let summary = summary(vec![sub("hw1", 10.0, true), sub("hw2", 5.0, true), sub("hw3", 0.0, false)]);
        let stored = CourseGradeRow {
            id: 1,
            learner_id: 7,
            course_id: course(),
            course_edited_at: edited(),
            grading_policy_hash: "older".into(),
            percent_grade: 0.35,
            letter_grade: None,
            passed: false,
            passed_at: None,
            created_at: edited(),
            modified_at: edited(),
        };
        let empty = HashMap::new();
        let row = layout.row(&RowInput {
            learner: &learner,
            summary: &summary,
            course_grade: Some(&stored),
            units: &HashMap::new(),
            scores: &HashMap::new(),
            persisted: &HashMap::new(),
            visible: &empty,
        });
        assert_eq!(&row[4..6], &["0.35", ""]);
        assert_eq!(&row[6..], &["1", "0.5", NOT_ATTEMPTED, "0.5"]);
    }

    #[test]
    fn test_problem_columns_and_markers() {
        let v = three_homeworks();
        let layout = ReportLayout::new(ReportKind::Problem, &v);
        assert_eq!(layout.header()[5], "Homework 1: hw1 - p1 (Earned)");
        assert_eq!(layout.header()[8], "Homework 2: Second - p2 (Possible)");

        let learner = enrolled();
        let summary = summary(vec![]);
        let hw2 = key("sequential", "hw2");
        let visible = VisibleBlocks::new(
            course(),
            vec![BlockRecord {
                locator: key("problem", "p2"),
                weight: None,
                raw_possible: 10.0,
                graded: true,
            }],
        );
        let hash = visible.hash().unwrap();
        let mut persisted = HashMap::new();
        persisted.insert(
            hw2.clone(),
            SubsectionGradeRow {
                id: 1,
                learner_id: 7,
                course_id: course(),
                subsection_id: hw2,
                course_version: "v1".into(),
                subsection_edited_at: edited(),
                earned_all: 4.0,
                possible_all: 10.0,
                earned_graded: 4.0,
                possible_graded: 10.0,
                first_attempted: Some(edited()),
                visible_blocks_hash: hash.clone(),
                overridden: false,
                created_at: edited(),
                modified_at: edited(),
            },
        );
        let mut scores = HashMap::new();
        scores.insert(
            key("problem", "p2"),
            BlockScore {
                learner_id: 7,
                block_id: key("problem", "p2"),
                course_id: course(),
                raw_earned: 4.0,
                raw_possible: 10.0,
                weight: None,
                source: grades_common::events::ScoreSource::BlockState,
                modified_at: edited(),
                deleted: false,
                grader_response: None,
            },
        );
        let visible_map: HashMap<_, _> = [(hash, visible)].into_iter().collect();
        let units = HashMap::new();
        let row = layout.row(&RowInput {
            learner: &learner,
            summary: &summary,
            course_grade: None,
            units: &units,
            scores: &scores,
            persisted: &persisted,
            visible: &visible_map,
        });
        assert_eq!(&row[..5], &["7", "learner7@example.com", "learner7", "active", "0.5"]);
        // p1 unattempted; p2 scored; p3 added after the grade was computed
        assert_eq!(
            &row[5..11],
            &[NOT_ATTEMPTED, NOT_ATTEMPTED, "4", "10", NOT_AVAILABLE, NOT_AVAILABLE]
        );
    }

    #[test]
    fn test_progress_uses_display_names_and_all_points() {
        let v = three_homeworks();
        let layout = ReportLayout::new(ReportKind::Progress, &v);
        assert_eq!(layout.header(), &["learner_id", "email", "username", "hw1", "Second", "hw3"]);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("problem".parse::<ReportKind>().unwrap(), ReportKind::Problem);
        assert!("certificates".parse::<ReportKind>().is_err());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number(0.5), "0.5");
        assert_eq!(number(1.0), "1");
        assert_eq!(number(1.0 / 3.0), "0.3333");
    }
}
