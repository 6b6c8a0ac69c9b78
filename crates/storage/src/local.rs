//! Local filesystem storage backend
//!
//! Provides async file I/O with atomic writes to prevent partial/corrupt files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend rooted at a job directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Hidden sibling used for the write-then-rename pattern
    fn temp_path(&self, path: &str) -> PathBuf {
        let full_path = self.resolve_path(path);
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }
}

/// Map an I/O failure on `path` to a storage error
fn storage_error(op: &str, path: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: path.to_string(),
        }
    } else {
        Error::Storage {
            message: format!("Failed to {} {}: {}", op, path, e),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        fs::read(self.resolve_path(path))
            .await
            .map(Bytes::from)
            .map_err(|e| storage_error("read", path, e))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = self.temp_path(path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("create directory for", path, e))?;
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_error("create temp file for", path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| storage_error("write", path, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error("sync", path, e))?;

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(storage_error("publish", path, e));
        }

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve_path(path))
            .await
            .map_err(|e| storage_error("delete", path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_all(&self, prefix: &str) -> Result<()> {
        let full_path = self.resolve_path(prefix);
        let result = match fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full_path).await,
            Ok(_) => fs::remove_file(&full_path).await,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| storage_error("delete", prefix, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve_path(to);
        if fs::metadata(&target).await.is_ok() {
            return Err(Error::Storage {
                message: format!("Refusing to rename {} over existing {}", from, to),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("create directory for", to, e))?;
        }
        fs::rename(self.resolve_path(from), &target)
            .await
            .map_err(|e| storage_error("rename", from, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve_path(path)).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix);
        let mut results = Vec::new();

        let dir_to_scan = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(results),
            }
        };

        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let entry_path = entry.path();
                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                let Ok(relative) = entry_path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                // in-flight temp files are never visible
                let is_temp = entry.file_name().to_string_lossy().ends_with(".tmp");
                if relative.starts_with(prefix) && !is_temp {
                    results.push(relative);
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed files");
        Ok(results)
    }
}
