//! Runtime settings for the grades engine
//!
//! Two-tier configuration:
//! 1. **TOML bootstrap** (`grades_common::config::GradesConfig`): paths and logging
//! 2. **Database runtime**: tunables from the `settings` table, loaded here
//!
//! Missing or NULL settings are initialized with built-in defaults and
//! written back so the table always documents the effective values.

use crate::error::{GradesError, Result};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::info;

/// Runtime settings loaded from database
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    // === Scheduler ===
    /// Delay before a queued recompute is released, coalescing bursts
    pub recalculate_delay_ms: u64,
    pub scheduler_max_attempts: u32,
    pub scheduler_backoff_base_ms: u64,
    pub scheduler_backoff_max_ms: u64,
    pub scheduler_task_deadline_ms: u64,
    pub scheduler_workers: usize,

    // === Reports ===
    pub report_batch_size: usize,

    // === Events ===
    pub event_bus_capacity: usize,

    // === Frozen grades ===
    /// Days after course end at which grades freeze automatically; `None` never freezes
    pub grades_freeze_after_days: Option<u32>,

    // === Overrides ===
    pub override_history_limit: usize,

    // === Database ===
    pub database_max_lock_wait_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            recalculate_delay_ms: 2000,
            scheduler_max_attempts: 5,
            scheduler_backoff_base_ms: 250,
            scheduler_backoff_max_ms: 10_000,
            scheduler_task_deadline_ms: 30_000,
            scheduler_workers: 4,
            report_batch_size: 100,
            event_bus_capacity: 1000,
            grades_freeze_after_days: None,
            override_history_limit: 100,
            database_max_lock_wait_ms: 5000,
        }
    }
}

impl RuntimeSettings {
    /// Load runtime settings from database
    ///
    /// For each setting:
    /// 1. Try to read from database
    /// 2. If NULL or missing, use built-in default
    /// 3. Write default back to database for consistency
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        async fn get_setting<T>(
            pool: &SqlitePool,
            key: &str,
            default: T,
            parse: fn(&str) -> Result<T>,
        ) -> Result<T>
        where
            T: ToString,
        {
            let value_opt: Option<Option<String>> =
                sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                    .bind(key)
                    .fetch_optional(pool)
                    .await?;

            match value_opt.flatten() {
                Some(value) => parse(value.trim()).map_err(|e| {
                    GradesError::Common(grades_common::Error::Config(format!(
                        "Setting '{}': {}",
                        key, e
                    )))
                }),
                None => {
                    let default_str = default.to_string();
                    info!("Setting '{}' not found in database, using default: {}", key, default_str);
                    sqlx::query(
                        "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)",
                    )
                    .bind(key)
                    .bind(&default_str)
                    .execute(pool)
                    .await?;
                    Ok(default)
                }
            }
        }

        fn invalid(what: &str, raw: &str) -> GradesError {
            GradesError::Common(grades_common::Error::Config(format!(
                "Invalid {}: '{}'",
                what, raw
            )))
        }

        let parse_u64: fn(&str) -> Result<u64> = |s| s.parse().map_err(|_| invalid("u64", s));
        let parse_u32: fn(&str) -> Result<u32> = |s| s.parse().map_err(|_| invalid("u32", s));
        let parse_usize: fn(&str) -> Result<usize> =
            |s| s.parse().map_err(|_| invalid("usize", s));

        let defaults = Self::default();
        let settings = Self {
            recalculate_delay_ms: get_setting(pool, "recalculate_delay_ms", defaults.recalculate_delay_ms, parse_u64).await?,
            scheduler_max_attempts: get_setting(pool, "scheduler_max_attempts", defaults.scheduler_max_attempts, parse_u32).await?.max(1),
            scheduler_backoff_base_ms: get_setting(pool, "scheduler_backoff_base_ms", defaults.scheduler_backoff_base_ms, parse_u64).await?,
            scheduler_backoff_max_ms: get_setting(pool, "scheduler_backoff_max_ms", defaults.scheduler_backoff_max_ms, parse_u64).await?,
            scheduler_task_deadline_ms: get_setting(pool, "scheduler_task_deadline_ms", defaults.scheduler_task_deadline_ms, parse_u64).await?,
            scheduler_workers: get_setting(pool, "scheduler_workers", defaults.scheduler_workers, parse_usize).await?.max(1),
            report_batch_size: get_setting(pool, "report_batch_size", defaults.report_batch_size, parse_usize).await?.max(1),
            event_bus_capacity: get_setting(pool, "event_bus_capacity", defaults.event_bus_capacity, parse_usize).await?.max(1),
            // Empty string means "never"
            grades_freeze_after_days: {
                let raw = get_setting(pool, "grades_freeze_after_days", String::new(), |s| Ok(s.to_string())).await?;
                if raw.is_empty() {
                    None
                } else {
                    Some(parse_u32(&raw)?)
                }
            },
            override_history_limit: get_setting(pool, "override_history_limit", defaults.override_history_limit, parse_usize).await?,
            database_max_lock_wait_ms: get_setting(pool, "database_max_lock_wait_ms", defaults.database_max_lock_wait_ms, parse_u64).await?,
        };

        info!("Loaded runtime settings from database");
        Ok(settings)
    }

    pub fn recalculate_delay(&self) -> Duration {
        Duration::from_millis(self.recalculate_delay_ms)
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_millis(self.scheduler_task_deadline_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling from the base
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .scheduler_backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.scheduler_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
