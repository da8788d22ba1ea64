//! Course structure port
//!
//! The engine reads course content through [`CourseStructure`]; it never
//! mutates it. A [`CourseStructureView`] is an immutable snapshot, shared
//! behind an `Arc` for the duration of one computation.

use crate::error::{GradesError, Result};
use crate::policy::GradingPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grades_common::{CourseKey, UsageKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A scorable block inside a subsection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub usage_key: UsageKey,
    #[serde(default)]
    pub display_name: String,
    /// Raw points possible advertised by the content
    pub possible: f64,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl BlockInfo {
    /// Points possible after weighting; what a missing score contributes
    pub fn weighted_possible(&self) -> f64 {
        match self.weight {
            Some(w) if self.possible > 0.0 => w,
            _ => self.possible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionInfo {
    pub usage_key: UsageKey,
    #[serde(default)]
    pub display_name: String,
    /// Assignment type name, if the subsection is assigned one
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub graded: bool,
    #[serde(default)]
    pub weight: Option<f64>,
    pub edited_at: DateTime<Utc>,
    #[serde(default)]
    pub blocks: Vec<BlockInfo>,
}

/// Immutable snapshot of a course
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseStructureView {
    pub course_key: CourseKey,
    pub content_version: String,
    pub edited_at: DateTime<Utc>,
    #[serde(default)]
    pub course_end: Option<DateTime<Utc>>,
    pub grading_policy: GradingPolicy,
    /// Subsections in course order
    pub subsections: Vec<SubsectionInfo>,
}

impl CourseStructureView {
    /// Check internal consistency and normalize keys
    pub fn validated(mut self) -> Result<Self> {
        self.course_key = self.course_key.normalized();
        self.grading_policy.validate()?;

        let mut seen = std::collections::HashSet::new();
        for subsection in &mut self.subsections {
            subsection.usage_key = subsection.usage_key.normalized();
            if subsection.usage_key.course_key() != &self.course_key {
                return Err(GradesError::StructureUnavailable(format!(
                    "Subsection {} does not belong to {}",
                    subsection.usage_key, self.course_key
                )));
            }
            if !seen.insert(subsection.usage_key.clone()) {
                return Err(GradesError::StructureUnavailable(format!(
                    "Duplicate subsection {}",
                    subsection.usage_key
                )));
            }
            for block in &mut subsection.blocks {
                block.usage_key = block.usage_key.normalized();
                if block.usage_key.course_key() != &self.course_key {
                    return Err(GradesError::StructureUnavailable(format!(
                        "Block {} does not belong to {}",
                        block.usage_key, self.course_key
                    )));
                }
                if !(block.possible >= 0.0) || block.weight.is_some_and(|w| !(w >= 0.0)) {
                    return Err(GradesError::StructureUnavailable(format!(
                        "Block {} has negative possible or weight",
                        block.usage_key
                    )));
                }
            }
        }
        Ok(self)
    }

    pub fn subsections(&self) -> &[SubsectionInfo] {
        &self.subsections
    }

    pub fn graded_subsections(&self) -> impl Iterator<Item = &SubsectionInfo> {
        self.subsections.iter().filter(|s| s.graded)
    }

    pub fn subsection(&self, key: &UsageKey) -> Option<&SubsectionInfo> {
        let key = key.normalized();
        self.subsections.iter().find(|s| s.usage_key == key)
    }

    /// All subsections containing the block (library references may place
    /// one block under several)
    pub fn parent_subsections(&self, block: &UsageKey) -> Vec<&SubsectionInfo> {
        let block = block.normalized();
        self.subsections
            .iter()
            .filter(|s| s.blocks.iter().any(|b| b.usage_key == block))
            .collect()
    }

    pub fn block(&self, key: &UsageKey) -> Option<&BlockInfo> {
        let key = key.normalized();
        self.subsections
            .iter()
            .flat_map(|s| s.blocks.iter())
            .find(|b| b.usage_key == key)
    }
}

/// Read-only access to course content
///
/// Implementors supply [`CourseStructure::snapshot`]; the remaining
/// operations default to reading from the snapshot so a single computation
/// can hold one consistent view.
#[async_trait]
pub trait CourseStructure: Send + Sync {
    async fn snapshot(&self, course: &CourseKey) -> Result<Arc<CourseStructureView>>;

    async fn get_subsections(&self, course: &CourseKey) -> Result<Vec<SubsectionInfo>> {
        Ok(self.snapshot(course).await?.subsections.clone())
    }

    async fn get_scorable_blocks(&self, subsection: &UsageKey) -> Result<Vec<BlockInfo>> {
        let view = self.snapshot(subsection.course_key()).await?;
        view.subsection(subsection)
            .map(|s| s.blocks.clone())
            .ok_or_else(|| unknown_subsection(subsection))
    }

    async fn get_parent_subsections(&self, block: &UsageKey) -> Result<Vec<SubsectionInfo>> {
        let view = self.snapshot(block.course_key()).await?;
        Ok(view.parent_subsections(block).into_iter().cloned().collect())
    }

    async fn content_version(&self, course: &CourseKey) -> Result<String> {
        Ok(self.snapshot(course).await?.content_version.clone())
    }

    async fn subsection_edited_at(&self, subsection: &UsageKey) -> Result<DateTime<Utc>> {
        let view = self.snapshot(subsection.course_key()).await?;
        view.subsection(subsection)
            .map(|s| s.edited_at)
            .ok_or_else(|| unknown_subsection(subsection))
    }

    async fn grading_policy(&self, course: &CourseKey) -> Result<GradingPolicy> {
        Ok(self.snapshot(course).await?.grading_policy.clone())
    }

    async fn course_edited_at(&self, course: &CourseKey) -> Result<DateTime<Utc>> {
        Ok(self.snapshot(course).await?.edited_at)
    }
}

pub(crate) fn unknown_subsection(subsection: &UsageKey) -> GradesError {
    GradesError::StructureUnavailable(format!("Unknown subsection {}", subsection))
}

/// In-process structure provider, optionally loaded from JSON snapshots
#[derive(Default)]
pub struct InMemoryCourseStructure {
    views: RwLock<HashMap<CourseKey, Arc<CourseStructureView>>>,
}

impl InMemoryCourseStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) a course snapshot
    pub async fn insert(&self, view: CourseStructureView) -> Result<()> {
        let view = view.validated()?;
        let key = view.course_key.clone();
        self.views.write().await.insert(key, Arc::new(view));
        Ok(())
    }

    pub async fn remove(&self, course: &CourseKey) -> bool {
        self.views.write().await.remove(&course.normalized()).is_some()
    }

    /// Load every `*.json` file in a directory as a course snapshot
    ///
    /// Files that fail to parse are skipped with a warning.
    pub async fn load_dir(dir: &Path) -> Result<Self> {
        let store = Self::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            let parsed = serde_json::from_str::<CourseStructureView>(&text)
                .map_err(GradesError::from)
                .and_then(|view| view.validated());
            match parsed {
                Ok(view) => {
                    let key = view.course_key.clone();
                    store.views.write().await.insert(key, Arc::new(view));
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid course structure"),
            }
        }
        info!(dir = %dir.display(), courses = loaded, "Loaded course structures");
        Ok(store)
    }

    pub async fn courses(&self) -> Vec<CourseKey> {
        let mut keys: Vec<_> = self.views.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CourseStructure for InMemoryCourseStructure {
    async fn snapshot(&self, course: &CourseKey) -> Result<Arc<CourseStructureView>> {
        self.views
            .read()
            .await
            .get(&course.normalized())
            .cloned()
            .ok_or_else(|| {
                GradesError::StructureUnavailable(format!("No structure snapshot for {}", course))
            })
    }
}
