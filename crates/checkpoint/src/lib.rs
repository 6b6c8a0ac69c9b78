//! Checkpoint lifecycle for step-indexed training
//!
//! Saves are handed to a background writer and become visible only once the
//! primary process commits them. Restore always reads the newest committed
//! step, and retention prunes older ones.

pub mod checkpointer;
pub mod manager;
pub mod writer;

pub use checkpointer::{
    create_checkpointer, CheckpointerOptions, ReplicatedCheckpointer, RestoredState,
    ShardedCheckpointer, TrainingCheckpointer,
};
pub use manager::{CheckpointManager, CheckpointManagerOptions};
pub use writer::{decode_item, encode_item, AsyncCheckpointWriter, ItemHeader};
