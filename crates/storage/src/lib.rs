//! Storage - Pluggable storage backends for checkpoints and run artifacts
//!
//! Every backend writes atomically: a reader either sees the previous
//! content of a path or the complete new content, never a partial write.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/job");
//! storage.write("checkpoints/100/state.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("checkpoints/100/state.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
