//! FileSystem trait abstraction for the local replica.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in repo-sync-daemon) - Uses tokio::fs
//!
//! Paths are vault-relative and use `/` as separator.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Local file access needed by the sync engine.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Overwrite an existing file (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Create a new file; fails with `AlreadyExists` if the path is taken
    async fn create(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Check if a file exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    /// Paths whose writes and deletes fail with an IO error
    failing: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write/create/delete of `path` fail until cleared.
    pub fn fail_writes_to(&self, path: &str) {
        self.failing
            .write()
            .unwrap()
            .insert(Self::normalize_path(path));
    }

    pub fn clear_failures(&self) {
        self.failing.write().unwrap().clear();
    }

    /// Synchronous read for assertions.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap()
            .get(&Self::normalize_path(path))
            .cloned()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        if self.failing.read().unwrap().contains(path) {
            return Err(FsError::Io(format!("simulated failure for {}", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        self.check_writable(&path)?;
        self.files.write().unwrap().insert(path, content.to_vec());
        Ok(())
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        self.check_writable(&path)?;
        let mut files = self.files.write().unwrap();
        if files.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        Ok(self.files.read().unwrap().contains_key(&path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        self.check_writable(&path)?;
        match self.files.write().unwrap().remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path)),
        }
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This lets tests keep a handle on the filesystem they hand to a coordinator
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).create(path, content).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }
}
