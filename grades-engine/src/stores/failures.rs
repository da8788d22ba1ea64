//! Failed scheduler task records
//!
//! Each row carries the serialized work item so an operator can replay it.

use crate::error::Result;
use chrono::{DateTime, Utc};
use grades_common::time;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub id: i64,
    pub event_transaction_id: Uuid,
    pub task_key: String,
    pub error_code: String,
    pub message: String,
    pub attempts: u32,
    pub payload: serde_json::Value,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FailureStore {
    pool: SqlitePool,
}

impl FailureStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        event_transaction_id: Uuid,
        task_key: &str,
        error_code: &str,
        message: &str,
        attempts: u32,
        payload: &serde_json::Value,
        failed_at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO grade_task_failures (
                event_transaction_id, task_key, error_code, message, attempts, payload, failed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_transaction_id.to_string())
        .bind(task_key)
        .bind(error_code)
        .bind(message)
        .bind(attempts)
        .bind(payload.to_string())
        .bind(time::to_db(&failed_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent failures first
    pub async fn recent(&self, limit: usize) -> Result<Vec<TaskFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_transaction_id, task_key, error_code, message, attempts, payload, failed_at
            FROM grade_task_failures
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TaskFailure> {
                let txn: String = row.try_get("event_transaction_id")?;
                let payload: String = row.try_get("payload")?;
                let failed_at: String = row.try_get("failed_at")?;
                Ok(TaskFailure {
                    id: row.try_get("id")?,
                    event_transaction_id: Uuid::parse_str(&txn).map_err(|e| {
                        grades_common::Error::Internal(format!("Bad transaction id '{}': {}", txn, e))
                    })?,
                    task_key: row.try_get("task_key")?,
                    error_code: row.try_get("error_code")?,
                    message: row.try_get("message")?,
                    attempts: row.try_get("attempts")?,
                    payload: serde_json::from_str(&payload)?,
                    failed_at: time::from_db(&failed_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grades_common::db::init_memory_database;

    #[tokio::test]
    async fn test_record_and_list() {
        let store = FailureStore::new(init_memory_database().await.unwrap());
        let txn = Uuid::new_v4();
        let payload = serde_json::json!({"kind": "score_changed", "learner_id": 4});

        store
            .record(txn, "4:hw1", "retry_exhausted", "stale", 5, &payload, time::now())
            .await
            .unwrap();
        store
            .record(Uuid::new_v4(), "5:hw1", "fatal_store_error", "x", 1, &payload, time::now())
            .await
            .unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].event_transaction_id, txn);
        assert_eq!(recent[1].payload, payload);
        assert_eq!(recent[1].attempts, 5);
    }
}
