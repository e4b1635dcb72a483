//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use repo_sync_core::fs::{FileSystem, FsError, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Vault directory on disk. Paths are relative to `base_path`.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a vault-relative path. Anything that could leave the vault
    /// (`..`, a root or drive prefix) is rejected.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut components = relative.components().peekable();
        if components.peek().is_none() {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        if !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    /// Remove directories left empty by a delete, stopping at the vault root.
    async fn prune_empty_parents(&self, full_path: &Path) {
        let mut dir = full_path.parent();
        while let Some(current) = dir {
            if current == self.base_path || !current.starts_with(&self.base_path) {
                break;
            }
            // Fails on the first non-empty directory
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    async fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

fn map_err(path: &str, err: std::io::Error) -> FsError {
    match err.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, err)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).await.map_err(|e| map_err(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        Self::ensure_parent(&full_path).await?;
        fs::write(&full_path, content)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        Self::ensure_parent(&full_path).await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| map_err(path, e))?;
        file.flush().await.map_err(|e| map_err(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path)?)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        if metadata.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::remove_file(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;
        self.prune_empty_parents(&full_path).await;
        Ok(())
    }
}
