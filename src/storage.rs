//! Blob storage seam.
//!
//! The pipeline only ever talks to the `Storage` trait; the default backend
//! maps named disks onto subdirectories of a local root. Writes go through a
//! temp file plus rename so a crashed upload never leaves a half-written
//! artifact at its final path.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{PipelineResult, UploadError};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Writes `bytes` atomically to `disk:path`, creating parent directories.
    async fn write(&self, disk: &str, path: &str, bytes: &[u8]) -> PipelineResult<()>;

    /// Reads the full contents of `disk:path`.
    async fn read(&self, disk: &str, path: &str) -> PipelineResult<Vec<u8>>;

    /// Removes the file if present. Returns whether anything was deleted.
    async fn delete_if_exists(&self, disk: &str, path: &str) -> PipelineResult<bool>;

    /// Recursively removes the directory if present. Returns whether anything
    /// was deleted.
    async fn delete_dir_if_exists(&self, disk: &str, path: &str) -> PipelineResult<bool>;

    async fn size(&self, disk: &str, path: &str) -> PipelineResult<Option<u64>>;

    async fn exists(&self, disk: &str, path: &str) -> PipelineResult<bool>;

    /// Mints a pre-signed URL for the artifact, when the backend supports it.
    /// Local disks return `None`.
    async fn temporary_url(&self, disk: &str, path: &str, ttl: Duration) -> Option<String>;
}

/// Local filesystem backend: `{root}/{disk}/{path}`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a disk-relative path, rejecting absolute paths and any `..`
    /// component. Relative paths here come from the deterministic layout, so
    /// a traversal attempt indicates a bug or tampering upstream.
    fn resolve(&self, disk: &str, path: &str) -> PipelineResult<PathBuf> {
        let rel = Path::new(path);
        let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe || disk.contains(['/', '\\']) {
            return Err(UploadError::StorageWriteFailed);
        }
        Ok(self.root.join(disk).join(rel))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn write(&self, disk: &str, path: &str, bytes: &[u8]) -> PipelineResult<()> {
        let target = self.resolve(disk, path)?;
        let parent = target.parent().ok_or(UploadError::StorageWriteFailed)?;
        tokio::fs::create_dir_all(parent).await?;

        // Write to a sibling temp file first; rename is atomic within one
        // filesystem, so readers never observe a partial artifact.
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, disk: &str, path: &str) -> PipelineResult<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(disk, path)?).await?)
    }

    async fn delete_if_exists(&self, disk: &str, path: &str) -> PipelineResult<bool> {
        let target = self.resolve(disk, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_dir_if_exists(&self, disk: &str, path: &str) -> PipelineResult<bool> {
        let target = self.resolve(disk, path)?;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, disk: &str, path: &str) -> PipelineResult<Option<u64>> {
        let target = self.resolve(disk, path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, disk: &str, path: &str) -> PipelineResult<bool> {
        Ok(self.size(disk, path).await?.is_some())
    }

    async fn temporary_url(&self, _disk: &str, _path: &str, _ttl: Duration) -> Option<String> {
        None
    }
}
