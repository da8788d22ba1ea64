//! Database initialization
//!
//! Opens (creating if needed) the grades database and creates every table
//! idempotently, then runs versioned migrations.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// SQLite busy timeout applied to every connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_tables(&pool).await?;
    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// The pool never recycles its only connection, so the database lives as
/// long as the pool.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_tables(&pool).await?;
    crate::db::migrations::run_migrations(&pool).await?;
    Ok(pool)
}

/// Create all tables (idempotent)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_block_scores_table(pool).await?;
    create_visible_blocks_table(pool).await?;
    create_subsection_grades_table(pool).await?;
    create_subsection_overrides_table(pool).await?;
    create_override_history_table(pool).await?;
    create_course_grades_table(pool).await?;
    create_frozen_courses_table(pool).await?;
    create_grade_task_failures_table(pool).await?;
    create_report_tasks_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_block_scores_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS block_scores (
            learner_id INTEGER NOT NULL,
            block_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            raw_earned REAL NOT NULL CHECK (raw_earned >= 0),
            raw_possible REAL NOT NULL CHECK (raw_possible >= 0),
            weight REAL CHECK (weight IS NULL OR weight >= 0),
            source TEXT NOT NULL CHECK (source IN ('block_state', 'submissions')),
            modified_at TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            grader_response TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (learner_id, block_id),
            CHECK (raw_earned <= raw_possible)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_visible_blocks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS visible_blocks (
            hash TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            blocks_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subsection_grades_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_grades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            learner_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            subsection_id TEXT NOT NULL,
            course_version TEXT NOT NULL,
            subsection_edited_at TEXT NOT NULL,
            earned_all REAL NOT NULL,
            possible_all REAL NOT NULL,
            earned_graded REAL NOT NULL,
            possible_graded REAL NOT NULL,
            first_attempted TEXT,
            visible_blocks_hash TEXT NOT NULL REFERENCES visible_blocks(hash),
            overridden INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            UNIQUE (learner_id, subsection_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subsection_overrides_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_overrides (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            grade_id INTEGER NOT NULL UNIQUE
                REFERENCES subsection_grades(id) ON DELETE CASCADE,
            earned_all_override REAL,
            possible_all_override REAL,
            earned_graded_override REAL,
            possible_graded_override REAL,
            reason_code TEXT NOT NULL,
            feature TEXT NOT NULL,
            actor_id INTEGER,
            comment TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only override history
///
/// Deliberately has no foreign key to `subsection_grades`: history outlives
/// grade resets.
async fn create_override_history_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_override_history (
            history_id INTEGER PRIMARY KEY AUTOINCREMENT,
            override_id INTEGER NOT NULL,
            grade_id INTEGER NOT NULL,
            learner_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            subsection_id TEXT NOT NULL,
            earned_all_override REAL,
            possible_all_override REAL,
            earned_graded_override REAL,
            possible_graded_override REAL,
            reason_code TEXT NOT NULL,
            feature TEXT NOT NULL,
            actor_id INTEGER,
            comment TEXT,
            history_type TEXT NOT NULL CHECK (history_type IN ('+', '~', '-')),
            history_date TEXT NOT NULL,
            history_actor_id INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_course_grades_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course_grades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            learner_id INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            course_edited_at TEXT NOT NULL,
            grading_policy_hash TEXT NOT NULL,
            percent_grade REAL NOT NULL CHECK (percent_grade >= 0 AND percent_grade <= 1),
            letter_grade TEXT,
            passed INTEGER NOT NULL DEFAULT 0,
            passed_at TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            UNIQUE (learner_id, course_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_frozen_courses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS frozen_courses (
            course_id TEXT PRIMARY KEY,
            frozen_at TEXT NOT NULL,
            frozen_by INTEGER,
            reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_grade_task_failures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS grade_task_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_transaction_id TEXT NOT NULL,
            task_key TEXT NOT NULL,
            error_code TEXT NOT NULL,
            message TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            payload TEXT NOT NULL,
            failed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_report_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS report_tasks (
            task_id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            report_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            filters TEXT NOT NULL,
            attempted INTEGER NOT NULL DEFAULT 0,
            succeeded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            last_learner_id INTEGER,
            report_bytes INTEGER NOT NULL DEFAULT 0,
            error_bytes INTEGER NOT NULL DEFAULT 0,
            work_dir TEXT NOT NULL,
            report_location TEXT,
            error_location TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a setting if absent (or NULL), leaving existing values untouched
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    let written = result.rows_affected() > 0;
    if written {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
    }
    Ok(written)
}
