//! Event types for the grades pipeline
//!
//! Outbound grade events travel on a single typed [`EventBus`]. Inbound
//! events and the normalized score/override payloads live in sub-modules.

mod inbound_types;
mod score_types;

pub use inbound_types::InboundEvent;
pub use score_types::{
    OverrideChanged, OverrideFeature, OverrideFields, ScoreSource, WeightedScoreChanged,
};

use crate::keys::{CourseKey, LearnerId, UsageKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Outbound grade events
///
/// Every variant carries the `event_transaction_id` of the inbound event that
/// caused it, so downstream consumers can correlate and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GradeEvent {
    /// A subsection grade was (re)computed and persisted
    SubsectionGradeChanged {
        event_transaction_id: Uuid,
        learner_id: LearnerId,
        course_id: CourseKey,
        subsection_id: UsageKey,
        earned_all: f64,
        possible_all: f64,
        earned_graded: f64,
        possible_graded: f64,
        first_attempted_at: Option<DateTime<Utc>>,
        visible_blocks_hash: String,
        /// Course content version at computation time
        version: String,
        /// Subsection structure edit time at computation time
        edited_at: DateTime<Utc>,
        /// Whether an active override shaped the persisted values
        overridden: bool,
        timestamp: DateTime<Utc>,
    },

    /// A course grade was (re)computed and persisted
    CourseGradeChanged {
        event_transaction_id: Uuid,
        learner_id: LearnerId,
        course_id: CourseKey,
        percent: f64,
        letter_grade: Option<String>,
        passed: bool,
        passed_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },

    /// Course grade crossed the passing boundary upwards
    CourseGradeNowPassed {
        event_transaction_id: Uuid,
        learner_id: LearnerId,
        course_id: CourseKey,
        timestamp: DateTime<Utc>,
    },

    /// Course grade crossed the passing boundary downwards
    CourseGradeNowFailed {
        event_transaction_id: Uuid,
        learner_id: LearnerId,
        course_id: CourseKey,
        timestamp: DateTime<Utc>,
    },

    /// Learner passed the course for the first time
    CourseGradePassedFirstTime {
        event_transaction_id: Uuid,
        learner_id: LearnerId,
        course_id: CourseKey,
        timestamp: DateTime<Utc>,
    },

    /// A scheduler task gave up; payload holds the triggering work for replay
    GradeTaskFailed {
        event_transaction_id: Uuid,
        task_key: String,
        error_code: String,
        message: String,
        attempts: u32,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// Report job progress after a batch
    ReportProgress {
        event_transaction_id: Uuid,
        course_id: CourseKey,
        report_kind: String,
        attempted: u64,
        succeeded: u64,
        failed: u64,
        /// Learners excluded by report filters
        skipped: u64,
        total: u64,
        timestamp: DateTime<Utc>,
    },
}

impl GradeEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            GradeEvent::SubsectionGradeChanged { .. } => "SubsectionGradeChanged",
            GradeEvent::CourseGradeChanged { .. } => "CourseGradeChanged",
            GradeEvent::CourseGradeNowPassed { .. } => "CourseGradeNowPassed",
            GradeEvent::CourseGradeNowFailed { .. } => "CourseGradeNowFailed",
            GradeEvent::CourseGradePassedFirstTime { .. } => "CourseGradePassedFirstTime",
            GradeEvent::GradeTaskFailed { .. } => "GradeTaskFailed",
            GradeEvent::ReportProgress { .. } => "ReportProgress",
        }
    }

    pub fn event_transaction_id(&self) -> Uuid {
        match self {
            GradeEvent::SubsectionGradeChanged { event_transaction_id, .. }
            | GradeEvent::CourseGradeChanged { event_transaction_id, .. }
            | GradeEvent::CourseGradeNowPassed { event_transaction_id, .. }
            | GradeEvent::CourseGradeNowFailed { event_transaction_id, .. }
            | GradeEvent::CourseGradePassedFirstTime { event_transaction_id, .. }
            | GradeEvent::GradeTaskFailed { event_transaction_id, .. }
            | GradeEvent::ReportProgress { event_transaction_id, .. } => *event_transaction_id,
        }
    }

    /// Course the event belongs to, when it is course scoped
    pub fn course_id(&self) -> Option<&CourseKey> {
        match self {
            GradeEvent::SubsectionGradeChanged { course_id, .. }
            | GradeEvent::CourseGradeChanged { course_id, .. }
            | GradeEvent::CourseGradeNowPassed { course_id, .. }
            | GradeEvent::CourseGradeNowFailed { course_id, .. }
            | GradeEvent::CourseGradePassedFirstTime { course_id, .. }
            | GradeEvent::ReportProgress { course_id, .. } => Some(course_id),
            GradeEvent::GradeTaskFailed { .. } => None,
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Distribution bus for outbound grade events
///
/// Wraps `tokio::sync::broadcast`: publishing never blocks on slow
/// subscribers, and a subscriber that falls more than `capacity` events
/// behind observes `RecvError::Lagged`.
///
/// # Examples
///
/// ```
/// use grades_common::events::EventBus;
///
/// let bus = EventBus::new(100);
/// let _rx = bus.subscribe();
/// assert_eq!(bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GradeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<GradeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: GradeEvent,
    ) -> Result<usize, broadcast::error::SendError<GradeEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: GradeEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course() -> CourseKey {
        "course-v1:Org+C1+R1".parse().unwrap()
    }

    fn passed_event() -> GradeEvent {
        GradeEvent::CourseGradeNowPassed {
            event_transaction_id: Uuid::new_v4(),
            learner_id: 1,
            course_id: course(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_without_subscribers_errors() {
        let bus = EventBus::new(10);
        assert!(bus.emit(passed_event()).is_err());
        // Lossy variant never reports
        bus.emit_lossy(passed_event());
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let event = passed_event();
        let id = event.event_transaction_id();
        assert_eq!(bus.emit(event).unwrap(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "CourseGradeNowPassed");
        assert_eq!(received.event_transaction_id(), id);
        assert_eq!(received.course_id(), Some(&course()));
    }

    #[test]
    fn test_grade_event_serializes_with_type_tag() {
        let json = serde_json::to_value(passed_event()).unwrap();
        assert_eq!(json["type"], "CourseGradeNowPassed");
        assert_eq!(json["course_id"], "course-v1:Org+C1+R1");
    }

    #[test]
    fn test_task_failed_has_no_course() {
        let event = GradeEvent::GradeTaskFailed {
            event_transaction_id: Uuid::new_v4(),
            task_key: "1:block-v1:Org+C1+R1+type@sequential+block@s1".to_string(),
            error_code: "retry_exhausted".to_string(),
            message: "gave up".to_string(),
            attempts: 5,
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
        };
        assert!(event.course_id().is_none());
    }
}
