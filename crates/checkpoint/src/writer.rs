//! Async checkpoint writer for non-blocking I/O
//!
//! A single background task drains write requests one at a time, so writes
//! for one manager never interleave. A step becomes visible only once the
//! primary process writes its commit marker, after every process has
//! finished writing its items.

use bytes::{BufMut, Bytes, BytesMut};
use runtime_core::{Barrier, CheckpointMetadata, Error, ProcessGroup, Result, Step};
use std::collections::HashMap;
use std::sync::Arc;
use storage::StorageBackend;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::manager::{step_dir, CheckpointIndex, CheckpointManagerOptions, CHECKPOINT_ROOT, COMMIT_FILE};

/// Magic bytes for checkpoint item files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 2;

/// Fixed-size part of the header: magic, version, step, shard index,
/// shard count, payload length, metadata length
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 4 + 4 + 8 + 4;

/// Decoded item header
#[derive(Debug, Clone, PartialEq)]
pub struct ItemHeader {
    pub version: u32,
    pub step: Step,
    pub shard_index: u32,
    pub num_shards: u32,
    pub payload_len: u64,
    pub metadata: HashMap<String, String>,
}

/// Frame a payload with its header
pub fn encode_item(
    step: Step,
    shard_index: u32,
    num_shards: u32,
    metadata: &HashMap<String, String>,
    payload: &[u8],
) -> Result<Bytes> {
    let metadata_json = serde_json::to_vec(metadata)?;
    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata_json.len() + payload.len());

    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(CHECKPOINT_VERSION);
    buf.put_u64_le(step);
    buf.put_u32_le(shard_index);
    buf.put_u32_le(num_shards);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(metadata_json.len() as u32);
    buf.put_slice(&metadata_json);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Split an item file into header and payload, validating the frame
pub fn decode_item(expected_step: Step, data: &Bytes) -> Result<(ItemHeader, Bytes)> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        step: expected_step,
        reason,
    };

    if data.len() < FIXED_HEADER_LEN {
        return Err(corrupted(format!("item too short ({} bytes)", data.len())));
    }
    if data[..4] != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid checkpoint magic".to_string()));
    }

    let u32_at = |offset: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[offset..offset + 4]);
        u32::from_le_bytes(raw)
    };
    let u64_at = |offset: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[offset..offset + 8]);
        u64::from_le_bytes(raw)
    };

    let version = u32_at(4);
    if version != CHECKPOINT_VERSION {
        return Err(corrupted(format!(
            "unsupported format version {version}, expected {CHECKPOINT_VERSION}"
        )));
    }
    let step = u64_at(8);
    if step != expected_step {
        return Err(Error::RestoredStepMismatch {
            expected: expected_step,
            actual: step,
        });
    }
    let shard_index = u32_at(16);
    let num_shards = u32_at(20);
    let payload_len = u64_at(24);
    let metadata_len = u32_at(32) as usize;

    let payload_start = FIXED_HEADER_LEN + metadata_len;
    let declared_len = (payload_start as u64)
        .checked_add(payload_len)
        .ok_or_else(|| corrupted(format!("payload length {payload_len} overflows")))?;
    if data.len() as u64 != declared_len {
        return Err(corrupted(format!(
            "length mismatch: header declares {} payload bytes, file has {}",
            payload_len,
            data.len().saturating_sub(payload_start)
        )));
    }

    let metadata: HashMap<String, String> =
        serde_json::from_slice(&data[FIXED_HEADER_LEN..payload_start])
            .map_err(|e| corrupted(format!("bad metadata: {e}")))?;

    Ok((
        ItemHeader {
            version,
            step,
            shard_index,
            num_shards,
            payload_len,
            metadata,
        },
        data.slice(payload_start..),
    ))
}

/// Request to persist one step
pub struct WriteRequest {
    /// Commit record for the step; written by the primary only
    pub metadata: CheckpointMetadata,

    /// Encoded items this process contributes (may be empty)
    pub items: Vec<(String, Bytes)>,

    /// Completion channel carrying the number of bytes this process wrote
    pub done: oneshot::Sender<Result<u64>>,
}

/// Everything the background task needs to write and prune
pub(crate) struct WriterContext {
    pub storage: Arc<dyn StorageBackend>,
    pub barrier: Arc<dyn Barrier>,
    pub index: Arc<CheckpointIndex>,
    pub options: CheckpointManagerOptions,
    pub group: ProcessGroup,
}

/// Async checkpoint writer using Tokio
pub struct AsyncCheckpointWriter {
    /// Task handle
    _task: tokio::task::JoinHandle<()>,
}

impl AsyncCheckpointWriter {
    /// Spawn the writer task; the returned sender accepts at most one queued request
    pub(crate) fn spawn(ctx: WriterContext) -> (mpsc::Sender<WriteRequest>, Self) {
        let (tx, rx) = mpsc::channel::<WriteRequest>(1);
        let task = tokio::spawn(Self::writer_loop(rx, ctx));
        (tx, Self { _task: task })
    }

    /// Main writer loop
    async fn writer_loop(mut rx: mpsc::Receiver<WriteRequest>, ctx: WriterContext) {
        debug!("Checkpoint writer started");

        while let Some(request) = rx.recv().await {
            let step = request.metadata.step;
            let result = Self::write_step(&ctx, request.metadata, request.items).await;

            if let Err(e) = &result {
                error!(step, error = %e, "Failed to write checkpoint");
            }
            let _ = request.done.send(result);
        }

        debug!("Checkpoint writer stopped");
    }

    /// Write one step: prepare, write items, commit, prune, settle
    #[instrument(skip_all, fields(step = metadata.step, process = ctx.group.process_index))]
    async fn write_step(
        ctx: &WriterContext,
        mut metadata: CheckpointMetadata,
        items: Vec<(String, Bytes)>,
    ) -> Result<u64> {
        let start = std::time::Instant::now();
        let step = metadata.step;
        let dir = step_dir(step);

        // Leftovers of an interrupted save at this step are cleared before anyone writes.
        if ctx.group.is_primary() {
            ctx.storage.delete_all(&dir).await?;
        }
        ctx.barrier.wait(&format!("checkpoint:{step}:begin")).await?;

        let mut size = 0u64;
        for (name, data) in items {
            size += ctx.storage.write(&format!("{dir}/{name}"), data).await?;
        }

        ctx.barrier.wait(&format!("checkpoint:{step}:written")).await?;

        metadata.size_bytes = size;
        if ctx.group.is_primary() {
            let marker = serde_json::to_vec_pretty(&metadata)?;
            ctx.storage
                .write(&format!("{dir}/{COMMIT_FILE}"), Bytes::from(marker))
                .await
                .map_err(|e| Error::CheckpointWriteFailed {
                    step,
                    message: format!("commit marker: {e}"),
                })?;
        }

        let elapsed = start.elapsed();
        info!(
            step,
            size_bytes = size,
            elapsed_ms = elapsed.as_millis() as u64,
            throughput_mbps = (size as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
            "Checkpoint write complete"
        );

        ctx.index.insert(metadata);
        let doomed = ctx.index.prune(&ctx.options);
        if ctx.group.is_primary() {
            for old in doomed {
                Self::remove_checkpoint(ctx, old).await;
            }
        }

        // Nobody reports success before the marker and deletions are visible.
        ctx.barrier.wait(&format!("checkpoint:{step}:committed")).await?;

        Ok(size)
    }

    /// Hard or soft delete of a pruned step; failures are logged, not fatal
    async fn remove_checkpoint(ctx: &WriterContext, step: Step) {
        let dir = step_dir(step);
        let result = match &ctx.options.deleted_subdirectory {
            Some(subdir) => {
                let target = format!("{CHECKPOINT_ROOT}/{subdir}/{step}");
                match ctx.storage.rename(&dir, &target).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(step, error = %e, "Soft delete failed, deleting instead");
                        ctx.storage.delete_all(&dir).await
                    }
                }
            }
            None => ctx.storage.delete_all(&dir).await,
        };

        match result {
            Ok(()) => info!(step, "Removed old checkpoint"),
            Err(e) => warn!(step, error = %e, "Failed to delete old checkpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_frame() {
        let mut meta = HashMap::new();
        meta.insert("kind".to_string(), "train_state".to_string());

        let encoded = encode_item(42, 1, 4, &meta, b"payload").unwrap();
        let (header, payload) = decode_item(42, &encoded).unwrap();

        assert_eq!(header.step, 42);
        assert_eq!(header.shard_index, 1);
        assert_eq!(header.num_shards, 4);
        assert_eq!(header.metadata, meta);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn test_truncated_item_is_corrupted() {
        let encoded = encode_item(7, 0, 1, &HashMap::new(), &[9u8; 64]).unwrap();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(
            decode_item(7, &truncated),
            Err(Error::CheckpointCorrupted { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_length_is_corrupted() {
        let encoded = encode_item(7, 0, 1, &HashMap::new(), b"x").unwrap();
        let mut raw = encoded.to_vec();
        raw[24..32].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            decode_item(7, &Bytes::from(raw)),
            Err(Error::CheckpointCorrupted { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_step() {
        let encoded = encode_item(7, 0, 1, &HashMap::new(), b"x").unwrap();
        assert!(matches!(
            decode_item(8, &encoded),
            Err(Error::RestoredStepMismatch {
                expected: 8,
                actual: 7
            })
        ));

        let mut raw = encoded.to_vec();
        raw[0] = b'X';
        assert!(matches!(
            decode_item(7, &Bytes::from(raw)),
            Err(Error::CheckpointCorrupted { .. })
        ));
    }
}
