//! Content-addressed visible block records
//!
//! A record lists the blocks that contributed to a subsection grade. Records
//! are keyed by base64(SHA-256) of their canonical JSON and written once.

use crate::error::Result;
use grades_common::digest;
use grades_common::time;
use grades_common::{CourseKey, UsageKey};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

/// Format version of the record list; bump when the JSON shape changes
pub const BLOCK_RECORD_LIST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub locator: UsageKey,
    pub weight: Option<f64>,
    pub raw_possible: f64,
    pub graded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleBlocks {
    pub blocks: Vec<BlockRecord>,
    pub course_key: CourseKey,
    pub version: u32,
}

impl VisibleBlocks {
    pub fn new(course_key: CourseKey, blocks: Vec<BlockRecord>) -> Self {
        Self {
            blocks,
            course_key: course_key.normalized(),
            version: BLOCK_RECORD_LIST_VERSION,
        }
    }

    /// Canonical JSON and its digest
    pub fn canonical(&self) -> Result<(String, String)> {
        Ok(digest::hash_canonical(self)?)
    }

    pub fn hash(&self) -> Result<String> {
        Ok(self.canonical()?.1)
    }

    pub fn contains(&self, block: &UsageKey) -> bool {
        let block = block.normalized();
        self.blocks.iter().any(|b| b.locator == block)
    }
}

#[derive(Clone)]
pub struct VisibleBlocksStore {
    pool: SqlitePool,
}

impl VisibleBlocksStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write the record if absent and return its hash
    pub async fn ensure_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        record: &VisibleBlocks,
    ) -> Result<String> {
        let (json, hash) = record.canonical()?;
        sqlx::query(
            "INSERT OR IGNORE INTO visible_blocks (hash, course_id, blocks_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&hash)
        .bind(record.course_key.to_string())
        .bind(&json)
        .bind(time::to_db(&time::now()))
        .execute(&mut **tx)
        .await?;
        Ok(hash)
    }

    pub async fn get(&self, hash: &str) -> Result<Option<VisibleBlocks>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT blocks_json FROM visible_blocks WHERE hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }
}
