//! Database schema migrations
//!
//! Versioned, idempotent migrations tracked in `schema_version`. Tables are
//! created with their current shape by `init`; migrations bring databases
//! written by older builds up to date and add secondary indexes.
//!
//! Never modify an existing migration; add a new one and bump
//! `CURRENT_SCHEMA_VERSION`.

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    if current_version < 3 {
        migrate_v3(pool).await?;
        set_schema_version(pool, 3).await?;
        info!("Migration v3 completed");
    }

    Ok(())
}

/// Migration v1: secondary indexes for course-wide scans
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS idx_block_scores_course ON block_scores (course_id, learner_id)",
        "CREATE INDEX IF NOT EXISTS idx_subsection_grades_course ON subsection_grades (course_id, learner_id)",
        "CREATE INDEX IF NOT EXISTS idx_course_grades_course ON course_grades (course_id, learner_id)",
        "CREATE INDEX IF NOT EXISTS idx_override_history_grade ON subsection_override_history (grade_id, history_id)",
        "CREATE INDEX IF NOT EXISTS idx_task_failures_txn ON grade_task_failures (event_transaction_id)",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Migration v2: add grader_response to block_scores
///
/// Databases created before external-grader support lack the column.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    let has_column: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('block_scores') WHERE name = 'grader_response'",
    )
    .fetch_one(pool)
    .await?;

    if has_column > 0 {
        info!("  grader_response column already exists - skipping");
        return Ok(());
    }

    sqlx::query("ALTER TABLE block_scores ADD COLUMN grader_response TEXT")
        .execute(pool)
        .await?;

    info!("  Added grader_response column to block_scores");
    Ok(())
}

/// Migration v3: byte offsets for report resume
///
/// Skipped when report_tasks does not exist yet; `init` creates it with the
/// columns.
async fn migrate_v3(pool: &SqlitePool) -> Result<()> {
    let columns: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info('report_tasks')")
            .fetch_all(pool)
            .await?;

    if columns.is_empty() {
        info!("  report_tasks table absent - skipping");
        return Ok(());
    }

    for column in ["report_bytes", "error_bytes"] {
        if columns.iter().any(|c| c == column) {
            continue;
        }
        sqlx::query(&format!(
            "ALTER TABLE report_tasks ADD COLUMN {} INTEGER NOT NULL DEFAULT 0",
            column
        ))
        .execute(pool)
        .await?;
        info!("  Added {} column to report_tasks", column);
    }
    Ok(())
}
