//! Error types for grades-engine
//!
//! Every variant maps to a stable snake-case `code()` that boundaries use as
//! the structured refusal code, and reports whether the scheduler may retry.

use grades_common::events::ScoreSource;
use grades_common::{CourseKey, LearnerId};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, GradesError>;

#[derive(Error, Debug)]
pub enum GradesError {
    /// Anonymous handle resolves to no learner (swallowed by ingress)
    #[error("Unknown learner for anonymous id '{0}'")]
    UnknownLearner(String),

    /// Submission with zero points possible (dropped by ingress)
    #[error("Submission for {0} has zero points possible")]
    ZeroPossible(String),

    /// Score store not yet consistent with the triggering event
    #[error("Stale read for {key}: {detail}")]
    StaleRead { key: String, detail: String },

    /// Scheduler gave up on a task
    #[error("Retries exhausted for {key} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    /// Mutation attempted in a frozen course
    #[error("Grades are frozen for course {0}")]
    GradesFrozen(CourseKey),

    /// Override references a missing grade or violates earned <= possible
    #[error("Invalid override: {0}")]
    InvalidOverride(String),

    /// Course structure snapshot missing or incomplete
    #[error("Course structure unavailable: {0}")]
    StructureUnavailable(String),

    /// Per-learner failure inside a bulk job
    #[error("Report row for learner {learner_id} failed: {message}")]
    ReportPartialFailure { learner_id: LearnerId, message: String },

    /// Store rejected a write for integrity reasons
    #[error("Store rejected write: {0}")]
    FatalStoreError(String),

    /// Write from a source that does not own the score row
    #[error("Score for {block} is owned by {owner}, rejected write from {writer}")]
    SourceMismatch {
        block: String,
        owner: ScoreSource,
        writer: ScoreSource,
    },

    /// Negative values or earned > possible
    #[error("Invalid score: {0}")]
    InvalidScore(String),

    #[error("Invalid grading policy: {0}")]
    InvalidPolicy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task deadline of {0} ms exceeded")]
    DeadlineExceeded(u64),

    #[error(transparent)]
    Common(#[from] grades_common::Error),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for GradesError {
    /// Integrity violations become `FatalStoreError`; everything else stays a
    /// plain database error so lock contention remains retryable.
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if matches!(
                db_err.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            ) {
                return GradesError::FatalStoreError(db_err.message().to_string());
            }
        }
        GradesError::Database(err)
    }
}

impl GradesError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GradesError::UnknownLearner(_) => "unknown_learner",
            GradesError::ZeroPossible(_) => "zero_possible",
            GradesError::StaleRead { .. } => "stale_read",
            GradesError::RetryExhausted { .. } => "retry_exhausted",
            GradesError::GradesFrozen(_) => "grades_frozen",
            GradesError::InvalidOverride(_) => "invalid_override",
            GradesError::StructureUnavailable(_) => "structure_unavailable",
            GradesError::ReportPartialFailure { .. } => "report_partial_failure",
            GradesError::FatalStoreError(_) => "fatal_store_error",
            GradesError::SourceMismatch { .. } => "source_mismatch",
            GradesError::InvalidScore(_) => "invalid_score",
            GradesError::InvalidPolicy(_) => "invalid_policy",
            GradesError::Cancelled => "cancelled",
            GradesError::DeadlineExceeded(_) => "deadline_exceeded",
            GradesError::Common(grades_common::Error::NotFound(_)) => "not_found",
            GradesError::Common(grades_common::Error::InvalidInput(_)) => "invalid_input",
            GradesError::Common(_) | GradesError::Database(_) => "store_error",
            GradesError::Io(_) => "io_error",
            GradesError::Json(_) => "json_error",
        }
    }

    /// Whether the scheduler should try the task again
    pub fn is_retryable(&self) -> bool {
        match self {
            GradesError::StaleRead { .. }
            | GradesError::StructureUnavailable(_)
            | GradesError::DeadlineExceeded(_) => true,
            _ => self.is_lock_contention(),
        }
    }

    /// Transient SQLite lock/busy condition
    pub fn is_lock_contention(&self) -> bool {
        match self {
            GradesError::Common(err) => err.is_lock_contention(),
            GradesError::Database(err) => is_lock_message(&err.to_string()),
            _ => false,
        }
    }

    /// HTTP-equivalent status for boundary adapters
    pub fn status_code(&self) -> u16 {
        match self {
            GradesError::GradesFrozen(_) => 403,
            GradesError::InvalidOverride(_)
            | GradesError::InvalidScore(_)
            | GradesError::InvalidPolicy(_)
            | GradesError::ZeroPossible(_)
            | GradesError::SourceMismatch { .. } => 400,
            GradesError::UnknownLearner(_) | GradesError::Common(grades_common::Error::NotFound(_)) => 404,
            GradesError::Common(grades_common::Error::InvalidInput(_)) => 400,
            GradesError::StructureUnavailable(_) => 503,
            _ => 500,
        }
    }
}

fn is_lock_message(text: &str) -> bool {
    text.contains("database is locked") || text.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_is_structured_refusal() {
        let err = GradesError::GradesFrozen("course-v1:Org+C1+R1".parse().unwrap());
        assert_eq!(err.code(), "grades_frozen");
        assert_eq!(err.status_code(), 403);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("course-v1:Org+C1+R1"));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(GradesError::StaleRead {
            key: "k".into(),
            detail: "older".into()
        }
        .is_retryable());
        assert!(GradesError::StructureUnavailable("c".into()).is_retryable());
        assert!(GradesError::DeadlineExceeded(100).is_retryable());
        assert!(!GradesError::InvalidOverride("x".into()).is_retryable());
        assert!(!GradesError::FatalStoreError("x".into()).is_retryable());
    }

    #[test]
    fn test_common_not_found_code() {
        let err: GradesError = grades_common::Error::NotFound("grade 4".into()).into();
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_row_not_found_is_not_retryable() {
        let err: GradesError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "store_error");
        assert!(!err.is_retryable());
    }
}
