//! Inbound event schema
//!
//! Events arrive as JSON objects tagged by `type`, one per line when read
//! from a stream. Every event may carry an `event_transaction_id`; one is
//! generated when it is absent.

use super::score_types::{OverrideFeature, OverrideFields};
use crate::keys::{CourseKey, LearnerId, UsageKey};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// A problem block's state was set
    BlockScorePublished {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        learner_id: LearnerId,
        block_id: UsageKey,
        raw_earned: f64,
        raw_possible: f64,
        #[serde(default)]
        weight: Option<f64>,
        #[serde(default)]
        only_if_higher: bool,
        modified_at: DateTime<Utc>,
        #[serde(default)]
        deleted: bool,
        #[serde(default)]
        grader_response: Option<String>,
    },

    /// The submissions service recorded a score for an anonymous learner handle
    SubmissionScoreSet {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        anonymous_user_id: String,
        course_id: CourseKey,
        item_id: UsageKey,
        points_earned: f64,
        points_possible: f64,
        modified_at: DateTime<Utc>,
    },

    /// The submissions service reset a score
    SubmissionScoreReset {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        anonymous_user_id: String,
        course_id: CourseKey,
        item_id: UsageKey,
        modified_at: DateTime<Utc>,
    },

    /// Authoritative override of a persisted subsection grade
    OverrideRequested {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        subsection_grade_id: i64,
        fields: OverrideFields,
        reason_code: String,
        feature: OverrideFeature,
        #[serde(default)]
        actor_id: Option<LearnerId>,
        #[serde(default)]
        comment: Option<String>,
    },

    EnrollmentTrackChanged {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        learner_id: LearnerId,
        course_id: CourseKey,
    },

    CohortMembershipChanged {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        learner_id: LearnerId,
        course_id: CourseKey,
    },

    /// Proctoring review rejected the exam attempt
    ExamAttemptRejected {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        learner_id: LearnerId,
        subsection_id: UsageKey,
    },

    /// Proctoring review verified the exam attempt
    ExamAttemptVerified {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        learner_id: LearnerId,
        subsection_id: UsageKey,
    },

    /// Result message from the external grader queue
    ExternalGraderScoreSubmitted {
        #[serde(default)]
        event_transaction_id: Option<Uuid>,
        submission_id: String,
        queue_key: String,
        queue_name: String,
        score_msg: serde_json::Value,
    },
}

impl InboundEvent {
    /// Parse one JSON line
    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| Error::InvalidInput(format!("Malformed inbound event: {}", e)))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::BlockScorePublished { .. } => "BlockScorePublished",
            InboundEvent::SubmissionScoreSet { .. } => "SubmissionScoreSet",
            InboundEvent::SubmissionScoreReset { .. } => "SubmissionScoreReset",
            InboundEvent::OverrideRequested { .. } => "OverrideRequested",
            InboundEvent::EnrollmentTrackChanged { .. } => "EnrollmentTrackChanged",
            InboundEvent::CohortMembershipChanged { .. } => "CohortMembershipChanged",
            InboundEvent::ExamAttemptRejected { .. } => "ExamAttemptRejected",
            InboundEvent::ExamAttemptVerified { .. } => "ExamAttemptVerified",
            InboundEvent::ExternalGraderScoreSubmitted { .. } => "ExternalGraderScoreSubmitted",
        }
    }

    fn transaction_slot(&mut self) -> &mut Option<Uuid> {
        match self {
            InboundEvent::BlockScorePublished { event_transaction_id, .. }
            | InboundEvent::SubmissionScoreSet { event_transaction_id, .. }
            | InboundEvent::SubmissionScoreReset { event_transaction_id, .. }
            | InboundEvent::OverrideRequested { event_transaction_id, .. }
            | InboundEvent::EnrollmentTrackChanged { event_transaction_id, .. }
            | InboundEvent::CohortMembershipChanged { event_transaction_id, .. }
            | InboundEvent::ExamAttemptRejected { event_transaction_id, .. }
            | InboundEvent::ExamAttemptVerified { event_transaction_id, .. }
            | InboundEvent::ExternalGraderScoreSubmitted { event_transaction_id, .. } => {
                event_transaction_id
            }
        }
    }

    /// Transaction id of this event, assigning a fresh one if absent
    pub fn ensure_transaction_id(&mut self) -> Uuid {
        *self.transaction_slot().get_or_insert_with(Uuid::new_v4)
    }
}
