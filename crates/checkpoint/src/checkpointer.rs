//! Training checkpointers
//!
//! The loop talks to one [`TrainingCheckpointer`]. Two implementations exist,
//! picked once by [`create_checkpointer`] from the execution mode:
//!
//! - [`ReplicatedCheckpointer`]: every process holds the whole state, the
//!   primary writes one `state.ckpt` item and every process restores it.
//! - [`ShardedCheckpointer`]: every process holds its slice of the sharded
//!   variables and writes and restores its own `shard-*.ckpt` item.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{
    Barrier, CheckpointType, Error, PreemptionNotice, ProcessGroup, PrngKey, Result,
    StateProvenance, Step, TrainConfig, TrainState, TrainStateMetadata,
};
use std::collections::HashMap;
use std::sync::Arc;
use storage::StorageBackend;
use tracing::{info, warn};

use crate::manager::{step_dir, CheckpointManager, CheckpointManagerOptions};
use crate::writer::encode_item;

/// Item name of a replicated checkpoint
pub const REPLICATED_ITEM: &str = "state.ckpt";

/// Item name of one shard of a sharded checkpoint
pub fn shard_item(shard_index: usize, num_shards: usize) -> String {
    format!("shard-{shard_index:05}-of-{num_shards:05}.ckpt")
}

/// Result of [`TrainingCheckpointer::get_model_states`]
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    /// State held by this process
    pub state: TrainState,

    /// Restored or freshly initialized
    pub provenance: StateProvenance,

    /// Model parameter count of the global state
    pub total_num_params: u64,
}

/// Options beyond the manager's own
#[derive(Debug, Clone)]
pub struct CheckpointerOptions {
    /// When false, saves are skipped but restore still works
    pub enable_saving: bool,

    /// Restore the newest checkpoint not above this step
    pub restore_step_ceiling: Option<Step>,
}

impl Default for CheckpointerOptions {
    fn default() -> Self {
        Self {
            enable_saving: true,
            restore_step_ceiling: None,
        }
    }
}

/// Save/restore contract shared by both state layouts
#[async_trait]
pub trait TrainingCheckpointer: Send + Sync {
    /// Representation written by this checkpointer
    fn checkpoint_type(&self) -> CheckpointType;

    /// Step `get_model_states` restores, fixed at construction
    fn step_to_restore(&self) -> Option<Step>;

    /// Newest committed step
    fn latest_step(&self) -> Option<Step>;

    /// Whether the periodic schedule saves at `step`
    fn should_save(&self, step: Step) -> bool;

    /// Start a save of `state` at `step` if the schedule asks for one.
    ///
    /// Returns once the state is captured; the write continues in the background.
    async fn save_if_needed(
        &self,
        step: Step,
        state: &TrainState,
        metadata: &TrainStateMetadata,
    ) -> Result<bool>;

    /// Save at `step` unless a checkpoint at `step` or later already exists
    async fn save_final(
        &self,
        step: Step,
        state: &TrainState,
        metadata: &TrainStateMetadata,
    ) -> Result<bool>;

    /// Restore the newest checkpoint, or initialize from `init_key` if there is none
    async fn get_model_states(
        &self,
        metadata: &TrainStateMetadata,
        init_key: PrngKey,
    ) -> Result<RestoredState>;

    /// Surface a failure of a finished background save
    fn check_for_errors(&self) -> Result<()>;

    /// Block until the outstanding save is durable
    async fn wait_until_finished(&self) -> Result<()>;

    /// Whether any process of the group was told it is about to be reclaimed.
    ///
    /// Collective: every process must call it at the same step.
    async fn reached_preemption(&self, step: Step) -> Result<bool>;
}

/// Bookkeeping common to both layouts
struct CheckpointerCore {
    manager: CheckpointManager,
    barrier: Arc<dyn Barrier>,
    preemption: PreemptionNotice,
    options: CheckpointerOptions,
    step_to_restore: Option<Step>,
    group: ProcessGroup,
}

impl CheckpointerCore {
    async fn new(
        storage: Arc<dyn StorageBackend>,
        barrier: Arc<dyn Barrier>,
        manager_options: CheckpointManagerOptions,
        options: CheckpointerOptions,
        preemption: PreemptionNotice,
    ) -> Result<Self> {
        let group = barrier.group();
        let manager = CheckpointManager::new(storage, barrier.clone(), manager_options).await?;
        let step_to_restore = manager.latest_step_at_or_below(options.restore_step_ceiling);

        if !options.enable_saving {
            warn!("Checkpoint saving is disabled");
        }

        Ok(Self {
            manager,
            barrier,
            preemption,
            options,
            step_to_restore,
            group,
        })
    }

    fn wants_periodic(&self, step: Step) -> bool {
        self.options.enable_saving && self.manager.should_save(step)
    }

    fn wants_final(&self, step: Step) -> bool {
        if !self.options.enable_saving {
            return false;
        }
        match self.manager.latest_saved_step() {
            Some(latest) if latest >= step => {
                info!(step, latest, "Checkpoint at or after final step exists, skipping");
                false
            }
            _ => true,
        }
    }

    async fn save(
        &self,
        step: Step,
        items: Vec<(String, Bytes)>,
        checkpoint_type: CheckpointType,
        num_shards: usize,
    ) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert("process_count".to_string(), self.group.process_count.to_string());
        self.manager
            .save(step, items, checkpoint_type, num_shards, metadata)
            .await
    }

    async fn reached_preemption(&self, step: Step) -> Result<bool> {
        let local = self.preemption.is_signaled();
        let reached = self
            .barrier
            .any(&format!("preemption:{step}"), local)
            .await?;
        if reached {
            warn!(step, local, "Preemption reached");
        }
        Ok(reached)
    }

    /// Step to restore, verified against the decoded state
    fn verify_restored(&self, step: Step, state: &TrainState) -> Result<()> {
        if state.step != step {
            return Err(Error::RestoredStepMismatch {
                expected: step,
                actual: state.step,
            });
        }
        Ok(())
    }
}

fn item_metadata(layout: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("kind".to_string(), "train_state".to_string());
    metadata.insert("layout".to_string(), layout.to_string());
    metadata
}

fn encode_state(state: &TrainState) -> Result<Vec<u8>> {
    bincode::serialize(state).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_state(step: Step, payload: &[u8]) -> Result<TrainState> {
    bincode::deserialize(payload).map_err(|e| Error::CheckpointCorrupted {
        step,
        reason: format!("undecodable train state: {e}"),
    })
}

/// Checkpointer for state replicated on every process
pub struct ReplicatedCheckpointer {
    core: CheckpointerCore,
}

impl ReplicatedCheckpointer {
    pub async fn new(
        storage: Arc<dyn StorageBackend>,
        barrier: Arc<dyn Barrier>,
        manager_options: CheckpointManagerOptions,
        options: CheckpointerOptions,
        preemption: PreemptionNotice,
    ) -> Result<Self> {
        let core =
            CheckpointerCore::new(storage, barrier, manager_options, options, preemption).await?;
        Ok(Self { core })
    }

    /// Only the primary contributes data; the others join the barriers
    fn items(&self, step: Step, state: &TrainState) -> Result<Vec<(String, Bytes)>> {
        if !self.core.group.is_primary() {
            return Ok(Vec::new());
        }
        let payload = encode_state(state)?;
        let item = encode_item(step, 0, 1, &item_metadata("replicated"), &payload)?;
        Ok(vec![(REPLICATED_ITEM.to_string(), item)])
    }
}

#[async_trait]
impl TrainingCheckpointer for ReplicatedCheckpointer {
    fn checkpoint_type(&self) -> CheckpointType {
        CheckpointType::Replicated
    }

    fn step_to_restore(&self) -> Option<Step> {
        self.core.step_to_restore
    }

    fn latest_step(&self) -> Option<Step> {
        self.core.manager.latest_step()
    }

    fn should_save(&self, step: Step) -> bool {
        self.core.wants_periodic(step)
    }

    async fn save_if_needed(
        &self,
        step: Step,
        state: &TrainState,
        _metadata: &TrainStateMetadata,
    ) -> Result<bool> {
        if !self.core.wants_periodic(step) {
            return Ok(false);
        }
        let items = self.items(step, state)?;
        self.core.save(step, items, CheckpointType::Replicated, 1).await?;
        Ok(true)
    }

    async fn save_final(
        &self,
        step: Step,
        state: &TrainState,
        _metadata: &TrainStateMetadata,
    ) -> Result<bool> {
        if !self.core.wants_final(step) {
            return Ok(false);
        }
        let items = self.items(step, state)?;
        self.core.save(step, items, CheckpointType::Replicated, 1).await?;
        Ok(true)
    }

    async fn get_model_states(
        &self,
        metadata: &TrainStateMetadata,
        init_key: PrngKey,
    ) -> Result<RestoredState> {
        let Some(step) = self.core.step_to_restore else {
            let provenance = StateProvenance::Initialized {
                init_key: init_key.words(),
            };
            let state = TrainState::initialize(metadata, init_key);
            info!(
                num_params = state.num_params(),
                "No checkpoint found, initialized fresh train state"
            );
            return Ok(RestoredState {
                total_num_params: state.num_params(),
                state,
                provenance,
            });
        };

        let (_, payload) = self.core.manager.restore_item(step, REPLICATED_ITEM).await?;
        let state = decode_state(step, &payload)?;
        self.core.verify_restored(step, &state)?;
        state.check_local_shapes(metadata, false)?;

        info!(step, num_params = state.num_params(), "Restored replicated train state");
        Ok(RestoredState {
            total_num_params: state.num_params(),
            state,
            provenance: StateProvenance::Restored {
                step,
                path: step_dir(step),
            },
        })
    }

    fn check_for_errors(&self) -> Result<()> {
        self.core.manager.check_for_errors()
    }

    async fn wait_until_finished(&self) -> Result<()> {
        self.core.manager.wait_until_finished().await
    }

    async fn reached_preemption(&self, step: Step) -> Result<bool> {
        self.core.reached_preemption(step).await
    }
}

/// Checkpointer for state sharded across processes
pub struct ShardedCheckpointer {
    core: CheckpointerCore,
}

impl ShardedCheckpointer {
    pub async fn new(
        storage: Arc<dyn StorageBackend>,
        barrier: Arc<dyn Barrier>,
        manager_options: CheckpointManagerOptions,
        options: CheckpointerOptions,
        preemption: PreemptionNotice,
    ) -> Result<Self> {
        let core =
            CheckpointerCore::new(storage, barrier, manager_options, options, preemption).await?;
        Ok(Self { core })
    }

    fn check_layout(&self, metadata: &TrainStateMetadata) -> Result<()> {
        if metadata.num_shards != self.core.group.process_count {
            return Err(Error::invalid_config(
                "num_shards",
                metadata.num_shards,
                format!(
                    "sharded state must have one shard per process ({})",
                    self.core.group.process_count
                ),
            ));
        }
        Ok(())
    }

    fn items(
        &self,
        step: Step,
        state: &TrainState,
        metadata: &TrainStateMetadata,
    ) -> Result<Vec<(String, Bytes)>> {
        self.check_layout(metadata)?;
        state.check_local_shapes(metadata, true)?;

        let ProcessGroup {
            process_index,
            process_count,
        } = self.core.group;
        let payload = encode_state(state)?;
        let item = encode_item(
            step,
            process_index as u32,
            process_count as u32,
            &item_metadata("sharded"),
            &payload,
        )?;
        Ok(vec![(shard_item(process_index, process_count), item)])
    }

    async fn save(&self, step: Step, state: &TrainState, metadata: &TrainStateMetadata) -> Result<()> {
        let items = self.items(step, state, metadata)?;
        self.core
            .save(step, items, CheckpointType::Sharded, self.core.group.process_count)
            .await
    }
}

#[async_trait]
impl TrainingCheckpointer for ShardedCheckpointer {
    fn checkpoint_type(&self) -> CheckpointType {
        CheckpointType::Sharded
    }

    fn step_to_restore(&self) -> Option<Step> {
        self.core.step_to_restore
    }

    fn latest_step(&self) -> Option<Step> {
        self.core.manager.latest_step()
    }

    fn should_save(&self, step: Step) -> bool {
        self.core.wants_periodic(step)
    }

    async fn save_if_needed(
        &self,
        step: Step,
        state: &TrainState,
        metadata: &TrainStateMetadata,
    ) -> Result<bool> {
        if !self.core.wants_periodic(step) {
            return Ok(false);
        }
        self.save(step, state, metadata).await?;
        Ok(true)
    }

    async fn save_final(
        &self,
        step: Step,
        state: &TrainState,
        metadata: &TrainStateMetadata,
    ) -> Result<bool> {
        if !self.core.wants_final(step) {
            return Ok(false);
        }
        self.save(step, state, metadata).await?;
        Ok(true)
    }

    async fn get_model_states(
        &self,
        metadata: &TrainStateMetadata,
        init_key: PrngKey,
    ) -> Result<RestoredState> {
        self.check_layout(metadata)?;
        let ProcessGroup {
            process_index,
            process_count,
        } = self.core.group;

        let Some(step) = self.core.step_to_restore else {
            let provenance = StateProvenance::Initialized {
                init_key: init_key.words(),
            };
            let state = TrainState::initialize(metadata, init_key).local_shard(metadata, process_index)?;
            info!(
                total_num_params = metadata.total_num_params(),
                "No checkpoint found, initialized fresh sharded train state"
            );
            return Ok(RestoredState {
                state,
                provenance,
                total_num_params: metadata.total_num_params(),
            });
        };

        let item = shard_item(process_index, process_count);
        let (header, payload) = self.core.manager.restore_item(step, &item).await?;
        if header.num_shards as usize != process_count || header.shard_index as usize != process_index {
            return Err(Error::CheckpointCorrupted {
                step,
                reason: format!(
                    "item {item} holds shard {} of {}",
                    header.shard_index, header.num_shards
                ),
            });
        }

        let state = decode_state(step, &payload)?;
        self.core.verify_restored(step, &state)?;
        state.check_local_shapes(metadata, true)?;

        info!(step, shard = process_index, "Restored sharded train state");
        Ok(RestoredState {
            state,
            provenance: StateProvenance::Restored {
                step,
                path: step_dir(step),
            },
            total_num_params: metadata.total_num_params(),
        })
    }

    fn check_for_errors(&self) -> Result<()> {
        self.core.manager.check_for_errors()
    }

    async fn wait_until_finished(&self) -> Result<()> {
        self.core.manager.wait_until_finished().await
    }

    async fn reached_preemption(&self, step: Step) -> Result<bool> {
        self.core.reached_preemption(step).await
    }
}

/// Build the checkpointer matching the configured execution mode
pub async fn create_checkpointer(
    config: &TrainConfig,
    storage: Arc<dyn StorageBackend>,
    barrier: Arc<dyn Barrier>,
    preemption: PreemptionNotice,
) -> Result<Box<dyn TrainingCheckpointer>> {
    let manager_options = CheckpointManagerOptions::from_config(config)?;
    let options = CheckpointerOptions {
        enable_saving: config.enable_checkpoint_saving,
        restore_step_ceiling: None,
    };

    let checkpointer: Box<dyn TrainingCheckpointer> = match config.resolved_checkpoint_type()? {
        CheckpointType::Replicated => Box::new(
            ReplicatedCheckpointer::new(storage, barrier, manager_options, options, preemption)
                .await?,
        ),
        CheckpointType::Sharded => Box::new(
            ShardedCheckpointer::new(storage, barrier, manager_options, options, preemption)
                .await?,
        ),
    };

    info!(
        checkpoint_type = %checkpointer.checkpoint_type(),
        step_to_restore = ?checkpointer.step_to_restore(),
        "Checkpointer created"
    );
    Ok(checkpointer)
}
