//! Storage backend trait definition
//!
//! Defines the async interface that all storage backends must implement.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for storage backends
///
/// Paths are relative to the backend root and use `/` as separator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist. The write is atomic
    /// (write to temp, then rename).
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete a single file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete everything under a directory-like prefix
    ///
    /// Deleting a missing prefix is not an error.
    async fn delete_all(&self, prefix: &str) -> Result<()>;

    /// Move a file or directory to a new path, replacing nothing
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
