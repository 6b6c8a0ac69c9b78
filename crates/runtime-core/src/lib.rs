//! Runtime Core - Foundation for the training loop runtime
//!
//! Provides core types, error handling, configuration, the train state model,
//! process-group synchronization and seed derivation shared by the
//! checkpoint and trainer crates.

pub mod config;
pub mod error;
pub mod rng;
pub mod runtime;
pub mod state;
pub mod sync;
pub mod types;

pub use config::{parse_duration, ExecutionMode, TrainConfig};
pub use error::{Error, Result};
pub use rng::{PrngKey, RunSeeds, SeedStream};
pub use runtime::{PreemptionNotice, RuntimeManager};
pub use state::{
    PartitionSpec, StateProvenance, Tensor, TrainState, TrainStateMetadata, VarMap, VariableSpec,
};
pub use sync::{Barrier, InMemoryBarrier, LocalBarrier, ProcessGroup};
pub use types::*;
