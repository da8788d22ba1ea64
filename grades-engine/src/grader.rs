//! External grader port
//!
//! Scores returned by an external grading queue are handed to this port
//! unchanged; whatever grades them later publishes an ordinary block score.

use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait ExternalGrader: Send + Sync {
    async fn score_submitted(
        &self,
        submission_id: &str,
        queue_key: &str,
        queue_name: &str,
        score_msg: &serde_json::Value,
    ) -> Result<()>;
}

/// Records delegated scores in the log and nothing else
#[derive(Debug, Default, Clone)]
pub struct LoggingExternalGrader;

#[async_trait]
impl ExternalGrader for LoggingExternalGrader {
    async fn score_submitted(
        &self,
        submission_id: &str,
        queue_key: &str,
        queue_name: &str,
        score_msg: &serde_json::Value,
    ) -> Result<()> {
        info!(
            submission_id,
            queue_key,
            queue_name,
            score = %score_msg,
            "External grader score delegated"
        );
        Ok(())
    }
}
