//! Checkpoint manager: save cadence, commit index, retention and deferred errors

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use runtime_core::{
    Barrier, CheckpointMetadata, CheckpointType, Error, ProcessGroup, Result, Step, TrainConfig,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use storage::StorageBackend;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::writer::{decode_item, AsyncCheckpointWriter, ItemHeader, WriteRequest, WriterContext};

/// Directory under the job root holding step directories
pub const CHECKPOINT_ROOT: &str = "checkpoints";

/// Marker whose presence makes a step directory a valid checkpoint
pub const COMMIT_FILE: &str = "commit_success.json";

/// Storage path of the directory for `step`
pub fn step_dir(step: Step) -> String {
    format!("{CHECKPOINT_ROOT}/{step}")
}

/// Checkpoint manager options
#[derive(Debug, Clone, Default)]
pub struct CheckpointManagerOptions {
    /// Retain at most this many recent checkpoints (None keeps all)
    pub max_to_keep: Option<usize>,

    /// Periodic save interval; 0 disables periodic saves
    pub save_interval_steps: Step,

    /// Keep one pruned checkpoint per wall-clock interval
    pub keep_time_interval: Option<Duration>,

    /// Move pruned checkpoints under this subdirectory instead of deleting
    pub deleted_subdirectory: Option<String>,
}

impl CheckpointManagerOptions {
    pub fn from_config(config: &TrainConfig) -> Result<Self> {
        Ok(Self {
            max_to_keep: config.save_max_to_keep,
            save_interval_steps: config.save_interval_steps,
            keep_time_interval: config.keep_time_interval()?,
            deleted_subdirectory: config.checkpoint_todelete_subdir.clone(),
        })
    }
}

#[derive(Default)]
struct IndexState {
    checkpoints: BTreeMap<Step, CheckpointMetadata>,
    /// Steps kept by the time-interval rule; exempt from `max_to_keep`
    preserved: BTreeSet<Step>,
    last_preserved: Option<DateTime<Utc>>,
}

/// Committed checkpoints known to this process
#[derive(Default)]
pub(crate) struct CheckpointIndex {
    inner: RwLock<IndexState>,
}

impl CheckpointIndex {
    pub(crate) fn insert(&self, metadata: CheckpointMetadata) {
        self.inner.write().checkpoints.insert(metadata.step, metadata);
    }

    fn latest(&self) -> Option<Step> {
        self.inner.read().checkpoints.keys().next_back().copied()
    }

    fn steps(&self) -> Vec<Step> {
        self.inner.read().checkpoints.keys().copied().collect()
    }

    fn get(&self, step: Step) -> Option<CheckpointMetadata> {
        self.inner.read().checkpoints.get(&step).cloned()
    }

    /// Drop the oldest unpreserved entries beyond `max_to_keep` and return their steps.
    ///
    /// Walking oldest first, an entry that is at least `keep_time_interval`
    /// newer than the last preserved one is preserved instead of removed.
    pub(crate) fn prune(&self, options: &CheckpointManagerOptions) -> Vec<Step> {
        let Some(max_to_keep) = options.max_to_keep else {
            return Vec::new();
        };

        let mut guard = self.inner.write();
        let state = &mut *guard;
        let candidates: Vec<Step> = state
            .checkpoints
            .keys()
            .filter(|step| !state.preserved.contains(*step))
            .copied()
            .collect();
        if candidates.len() <= max_to_keep {
            return Vec::new();
        }

        let excess = candidates.len() - max_to_keep;
        let mut removed = Vec::with_capacity(excess);
        for step in &candidates[..excess] {
            let created_at = state.checkpoints[step].created_at;
            let keep = match (options.keep_time_interval, state.last_preserved) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(interval), Some(last)) => (created_at - last)
                    .to_std()
                    .map(|elapsed| elapsed >= interval)
                    .unwrap_or(false),
            };

            if keep {
                debug!(step, "Preserving checkpoint by keep interval");
                state.preserved.insert(*step);
                state.last_preserved = Some(created_at);
            } else {
                state.checkpoints.remove(step);
                removed.push(*step);
            }
        }
        removed
    }
}

/// Save handed to the writer and not yet observed
struct PendingSave {
    step: Step,
    done: oneshot::Receiver<Result<u64>>,
}

/// Coordinates periodic saves, restore lookups and retention for one process
pub struct CheckpointManager {
    options: CheckpointManagerOptions,

    storage: Arc<dyn StorageBackend>,

    group: ProcessGroup,

    /// Committed checkpoints indexed by step
    index: Arc<CheckpointIndex>,

    /// Channel to the background writer
    write_tx: mpsc::Sender<WriteRequest>,

    pending: Mutex<Option<PendingSave>>,

    /// First failure not yet reported to the caller
    deferred_error: Mutex<Option<Error>>,

    /// Highest step handed to the writer
    last_requested: Mutex<Option<Step>>,

    _writer: AsyncCheckpointWriter,
}

impl CheckpointManager {
    /// Scan storage for committed checkpoints and start the writer.
    ///
    /// Every process of the group must call this; it ends with a barrier.
    pub async fn new(
        storage: Arc<dyn StorageBackend>,
        barrier: Arc<dyn Barrier>,
        options: CheckpointManagerOptions,
    ) -> Result<Self> {
        let group = barrier.group();
        let index = Arc::new(CheckpointIndex::default());

        for metadata in scan_committed(storage.as_ref()).await? {
            index.insert(metadata);
        }
        let stale = index.prune(&options);

        barrier.wait("checkpoint:manager:init").await?;

        if group.is_primary() {
            for step in &stale {
                if let Err(e) = storage.delete_all(&step_dir(*step)).await {
                    warn!(step, error = %e, "Failed to delete stale checkpoint");
                }
            }
        }

        info!(
            process = group.process_index,
            checkpoints = ?index.steps(),
            max_to_keep = ?options.max_to_keep,
            save_interval_steps = options.save_interval_steps,
            "Checkpoint manager ready"
        );

        let (write_tx, writer) = AsyncCheckpointWriter::spawn(WriterContext {
            storage: storage.clone(),
            barrier,
            index: index.clone(),
            options: options.clone(),
            group,
        });

        Ok(Self {
            options,
            storage,
            group,
            index,
            write_tx,
            pending: Mutex::new(None),
            deferred_error: Mutex::new(None),
            last_requested: Mutex::new(None),
            _writer: writer,
        })
    }

    pub fn options(&self) -> &CheckpointManagerOptions {
        &self.options
    }

    pub fn group(&self) -> ProcessGroup {
        self.group
    }

    /// Whether the periodic schedule asks for a save at `step`.
    ///
    /// Steps at or below the newest saved or in-flight step are never saved again.
    pub fn should_save(&self, step: Step) -> bool {
        let interval = self.options.save_interval_steps;
        if interval == 0 {
            return false;
        }
        if self.latest_saved_step().is_some_and(|latest| step <= latest) {
            return false;
        }
        step % interval == 0
    }

    /// Newest step that is committed or currently being written
    pub fn latest_saved_step(&self) -> Option<Step> {
        let requested = *self.last_requested.lock();
        requested.max(self.index.latest())
    }

    /// Newest committed step
    pub fn latest_step(&self) -> Option<Step> {
        self.index.latest()
    }

    /// Newest committed step not above `ceiling`
    pub fn latest_step_at_or_below(&self, ceiling: Option<Step>) -> Option<Step> {
        let steps = self.index.steps();
        match ceiling {
            Some(ceiling) => steps.into_iter().rev().find(|step| *step <= ceiling),
            None => steps.last().copied(),
        }
    }

    /// All committed steps, oldest first
    pub fn all_steps(&self) -> Vec<Step> {
        self.index.steps()
    }

    pub fn metadata(&self, step: Step) -> Option<CheckpointMetadata> {
        self.index.get(step)
    }

    /// Queue a write of `items` for `step`.
    ///
    /// Waits for the previous save first. Returns once the request is queued;
    /// failures surface through `check_for_errors` or `wait_until_finished`.
    pub async fn save(
        &self,
        step: Step,
        items: Vec<(String, Bytes)>,
        checkpoint_type: CheckpointType,
        num_shards: usize,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.drain_pending().await;

        let record = CheckpointMetadata {
            step,
            path: step_dir(step),
            size_bytes: 0,
            created_at: Utc::now(),
            checkpoint_type,
            num_shards,
            metadata,
        };
        let (done_tx, done_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest {
                metadata: record,
                items,
                done: done_tx,
            })
            .await
            .map_err(|e| Error::ChannelClosed {
                channel: format!("checkpoint write channel: {}", e),
            })?;

        *self.pending.lock() = Some(PendingSave {
            step,
            done: done_rx,
        });
        *self.last_requested.lock() = Some(step);

        debug!(step, "Queued checkpoint for async write");
        Ok(())
    }

    /// Report a failure of an already finished save, without blocking
    pub fn check_for_errors(&self) -> Result<()> {
        let finished = {
            let mut pending = self.pending.lock();
            let outcome = match pending.as_mut() {
                Some(save) => match save.done.try_recv() {
                    Ok(result) => Some((save.step, result)),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Closed) => Some((save.step, Err(writer_gone()))),
                },
                None => None,
            };
            if outcome.is_some() {
                *pending = None;
            }
            outcome
        };

        if let Some((step, Err(e))) = finished {
            self.defer_error(step, e);
        }
        self.take_error()
    }

    /// Block until the outstanding save is durable, then report any failure
    pub async fn wait_until_finished(&self) -> Result<()> {
        self.drain_pending().await;
        self.take_error()
    }

    /// Read and validate one item of a committed checkpoint
    pub async fn restore_item(&self, step: Step, name: &str) -> Result<(ItemHeader, Bytes)> {
        if self.index.get(step).is_none() {
            return Err(Error::CheckpointNotFound { step });
        }
        let path = format!("{}/{}", step_dir(step), name);
        let data = self.storage.read(&path).await.map_err(|e| match e {
            Error::StoragePathNotFound { .. } => Error::CheckpointCorrupted {
                step,
                reason: format!("missing item {name}"),
            },
            other => other,
        })?;
        decode_item(step, &data)
    }

    async fn drain_pending(&self) {
        let pending = self.pending.lock().take();
        if let Some(save) = pending {
            let result = save.done.await.unwrap_or_else(|_| Err(writer_gone()));
            if let Err(e) = result {
                self.defer_error(save.step, e);
            }
        }
    }

    fn defer_error(&self, step: Step, e: Error) {
        error!(step, error = %e, "Checkpoint save failed");
        let mut slot = self.deferred_error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn take_error(&self) -> Result<()> {
        match self.deferred_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn writer_gone() -> Error {
    Error::ChannelClosed {
        channel: "checkpoint writer".to_string(),
    }
}

/// Commit records of every step directory carrying a marker
async fn scan_committed(storage: &dyn StorageBackend) -> Result<Vec<CheckpointMetadata>> {
    let mut committed = Vec::new();
    for path in storage.list(&format!("{CHECKPOINT_ROOT}/")).await? {
        let parts: Vec<&str> = path.split('/').collect();
        let [_, step, file] = parts.as_slice() else {
            continue;
        };
        let Ok(step) = step.parse::<Step>() else {
            continue;
        };
        if *file != COMMIT_FILE {
            continue;
        }

        let raw = match storage.read(&path).await {
            Ok(raw) => raw,
            // pruned between listing and reading
            Err(Error::StoragePathNotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<CheckpointMetadata>(&raw) {
            Ok(metadata) if metadata.step == step => committed.push(metadata),
            Ok(metadata) => warn!(step, recorded = metadata.step, "Commit marker names another step"),
            Err(e) => warn!(step, error = %e, "Unreadable commit marker"),
        }
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::encode_item;
    use runtime_core::LocalBarrier;
    use storage::LocalStorage;
    use tempfile::tempdir;

    fn options(max_to_keep: Option<usize>, interval: Step) -> CheckpointManagerOptions {
        CheckpointManagerOptions {
            max_to_keep,
            save_interval_steps: interval,
            ..Default::default()
        }
    }

    async fn manager(root: &std::path::Path, opts: CheckpointManagerOptions) -> CheckpointManager {
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(root));
        CheckpointManager::new(storage, Arc::new(LocalBarrier), opts)
            .await
            .unwrap()
    }

    async fn save_step(manager: &CheckpointManager, step: Step) {
        let item = encode_item(step, 0, 1, &HashMap::new(), &step.to_le_bytes()).unwrap();
        manager
            .save(
                step,
                vec![("state.ckpt".to_string(), item)],
                CheckpointType::Replicated,
                1,
                HashMap::new(),
            )
            .await
            .unwrap();
    }

    fn metadata_at(step: Step, created_at: DateTime<Utc>) -> CheckpointMetadata {
        CheckpointMetadata {
            step,
            path: step_dir(step),
            size_bytes: 0,
            created_at,
            checkpoint_type: CheckpointType::Replicated,
            num_shards: 1,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_should_save_interval() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), options(None, 5)).await;

        for step in 0..30 {
            assert_eq!(manager.should_save(step), step % 5 == 0);
            assert_eq!(manager.should_save(step), step % 5 == 0);
        }

        let disabled = self::manager(dir.path(), options(None, 0)).await;
        assert!(!disabled.should_save(0));
        assert!(!disabled.should_save(10));
    }

    #[tokio::test]
    async fn test_should_save_skips_saved_steps() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), options(None, 5)).await;

        save_step(&manager, 10).await;
        assert!(!manager.should_save(5));
        assert!(!manager.should_save(10));
        assert!(manager.should_save(15));
        manager.wait_until_finished().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_and_rescan() {
        let dir = tempdir().unwrap();
        {
            let manager = manager(dir.path(), options(None, 1)).await;
            save_step(&manager, 3).await;
            manager.wait_until_finished().await.unwrap();
            assert_eq!(manager.latest_step(), Some(3));
        }

        // An interrupted save leaves items but no marker.
        let storage = LocalStorage::new(dir.path());
        storage
            .write("checkpoints/4/state.ckpt", Bytes::from_static(b"partial"))
            .await
            .unwrap();

        let reopened = manager(dir.path(), options(None, 1)).await;
        assert_eq!(reopened.all_steps(), vec![3]);
        let (header, payload) = reopened.restore_item(3, "state.ckpt").await.unwrap();
        assert_eq!(header.step, 3);
        assert_eq!(&payload[..], &3u64.to_le_bytes());
        assert!(matches!(
            reopened.restore_item(4, "state.ckpt").await,
            Err(Error::CheckpointNotFound { step: 4 })
        ));
    }

    #[tokio::test]
    async fn test_retention_keeps_most_recent() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), options(Some(2), 1)).await;

        for step in 1..=5 {
            save_step(&manager, step).await;
        }
        manager.wait_until_finished().await.unwrap();

        assert_eq!(manager.all_steps(), vec![4, 5]);
        let storage = LocalStorage::new(dir.path());
        assert!(!storage.exists("checkpoints/3").await.unwrap());
        assert!(storage.exists("checkpoints/5/commit_success.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete() {
        let dir = tempdir().unwrap();
        let opts = CheckpointManagerOptions {
            deleted_subdirectory: Some("trash".to_string()),
            ..options(Some(1), 1)
        };
        let manager = manager(dir.path(), opts.clone()).await;
        save_step(&manager, 1).await;
        save_step(&manager, 2).await;
        manager.wait_until_finished().await.unwrap();

        let storage = LocalStorage::new(dir.path());
        assert!(storage.exists("checkpoints/trash/1/state.ckpt").await.unwrap());

        // Soft-deleted steps are not committed checkpoints.
        let reopened = self::manager(dir.path(), opts).await;
        assert_eq!(reopened.all_steps(), vec![2]);
    }

    #[test]
    fn test_prune_preserves_by_time_interval() {
        let index = CheckpointIndex::default();
        let t0 = Utc::now();
        for (step, minutes) in [(1, 0), (2, 10), (3, 20), (4, 70), (5, 80), (6, 90)] {
            index.insert(metadata_at(step, t0 + chrono::Duration::minutes(minutes)));
        }

        let opts = CheckpointManagerOptions {
            max_to_keep: Some(2),
            keep_time_interval: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let removed = index.prune(&opts);

        assert_eq!(removed, vec![2, 3]);
        assert_eq!(index.steps(), vec![1, 4, 5, 6]);
        // Preserved steps do not count towards max_to_keep.
        assert!(index.prune(&opts).is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_deferred() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), options(None, 1)).await;

        // A regular file where the step directory should go makes the write fail.
        std::fs::write(dir.path().join("checkpoints"), b"not a directory").unwrap();
        save_step(&manager, 7).await;

        let err = manager.wait_until_finished().await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. } | Error::Io(_)));
        // Reported once.
        manager.check_for_errors().unwrap();
        assert_eq!(manager.latest_step(), None);
    }
}
