//! Score and override payload types
//!
//! Shared by the ingress layer, the scheduler and the inbound event schema.

use crate::keys::{CourseKey, LearnerId, UsageKey};
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upstream system that owns a block score row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// Per-block problem state store
    BlockState,
    /// External submissions service
    Submissions,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreSource::BlockState => "block_state",
            ScoreSource::Submissions => "submissions",
        }
    }
}

impl fmt::Display for ScoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoreSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "block_state" => Ok(ScoreSource::BlockState),
            "submissions" => Ok(ScoreSource::Submissions),
            other => Err(Error::InvalidInput(format!("Unknown score source: {}", other))),
        }
    }
}

/// Recognized override origins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideFeature {
    Gradebook,
    Proctoring,
    BulkCsv,
    SupportTool,
}

impl OverrideFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideFeature::Gradebook => "gradebook",
            OverrideFeature::Proctoring => "proctoring",
            OverrideFeature::BulkCsv => "bulk_csv",
            OverrideFeature::SupportTool => "support_tool",
        }
    }
}

impl fmt::Display for OverrideFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverrideFeature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "gradebook" => Ok(OverrideFeature::Gradebook),
            "proctoring" => Ok(OverrideFeature::Proctoring),
            "bulk_csv" => Ok(OverrideFeature::BulkCsv),
            "support_tool" => Ok(OverrideFeature::SupportTool),
            other => Err(Error::InvalidInput(format!("Unknown override feature: {}", other))),
        }
    }
}

/// Override field set; `None` falls through to the computed value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideFields {
    #[serde(default)]
    pub earned_all: Option<f64>,
    #[serde(default)]
    pub possible_all: Option<f64>,
    #[serde(default)]
    pub earned_graded: Option<f64>,
    #[serde(default)]
    pub possible_graded: Option<f64>,
}

impl OverrideFields {
    pub fn is_empty(&self) -> bool {
        self.earned_all.is_none()
            && self.possible_all.is_none()
            && self.earned_graded.is_none()
            && self.possible_graded.is_none()
    }
}

/// Normalized score change produced by ingress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedScoreChanged {
    pub event_transaction_id: Uuid,
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub block_id: UsageKey,
    pub weighted_earned: f64,
    pub weighted_possible: f64,
    /// Raw values persisted to the score store
    pub raw_earned: f64,
    pub raw_possible: f64,
    pub weight: Option<f64>,
    pub source: ScoreSource,
    pub modified_at: DateTime<Utc>,
    pub only_if_higher: bool,
    pub deleted: bool,
    pub grader_response: Option<String>,
}

/// An override on a subsection grade was created, changed or removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideChanged {
    pub event_transaction_id: Uuid,
    pub learner_id: LearnerId,
    pub course_id: CourseKey,
    pub subsection_id: UsageKey,
    pub feature: OverrideFeature,
    pub deleted: bool,
    pub modified_at: DateTime<Utc>,
}
