//! Report upload port

use crate::error::Result;
use async_trait::async_trait;
use grades_common::CourseKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Store a finished file under `name`; returns its location
    async fn store(&self, course: &CourseKey, name: &str, local_path: &Path) -> Result<String>;
}

/// Copies reports into `<root>/<course slug>/<name>`
pub struct FsReportStore {
    root: PathBuf,
}

impl FsReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn store(&self, course: &CourseKey, name: &str, local_path: &Path) -> Result<String> {
        let dir = self.root.join(course.slug());
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(name);
        let bytes = tokio::fs::copy(local_path, &target).await?;
        info!(course = %course, path = %target.display(), bytes, "Report stored");
        Ok(target.to_string_lossy().to_string())
    }
}

/// Keeps uploaded bytes in memory, keyed by location
#[derive(Default)]
pub struct MemoryReportStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, location: &str) -> Option<Vec<u8>> {
        self.files.read().await.get(location).cloned()
    }

    pub async fn locations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn store(&self, course: &CourseKey, name: &str, local_path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(local_path).await?;
        let location = format!("memory://{}/{}", course.slug(), name);
        self.files.write().await.insert(location.clone(), bytes);
        Ok(location)
    }
}
