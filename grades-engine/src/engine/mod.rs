//! Grade computation engines
//!
//! `SubsectionGradeEngine` aggregates block scores into persisted subsection
//! grades; `CourseGradeEngine` evaluates the grading policy over them.

pub mod course;
pub mod subsection;

pub use course::{CourseGradeEngine, CourseGradeSummary};
pub use subsection::{SubsectionGradeEngine, SubsectionScore};
