//! Benchmarks for checkpoint encode, save and restore throughput

use bytes::Bytes;
use checkpoint::{create_checkpointer, decode_item, encode_item};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use runtime_core::{LocalBarrier, PreemptionNotice, PrngKey, TrainConfig, TrainState};
use std::collections::HashMap;
use std::sync::Arc;
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;
use trainer::SyntheticConfig;

fn item_codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_item");

    for size in [1_000_000, 10_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        let payload = vec![7u8; *size];
        let metadata = HashMap::new();

        group.bench_function(format!("encode_{}MB", size / 1_000_000), |b| {
            b.iter(|| encode_item(100, 0, 1, &metadata, &payload).unwrap());
        });

        let encoded = encode_item(100, 0, 1, &metadata, &payload).unwrap();
        group.bench_function(format!("decode_{}MB", size / 1_000_000), |b| {
            b.iter(|| decode_item(100, &encoded).unwrap());
        });
    }

    group.finish();
}

fn bench_config(dir: &TempDir) -> TrainConfig {
    TrainConfig {
        job_log_dir: dir.path().to_path_buf(),
        save_max_to_keep: Some(2),
        ..Default::default()
    }
}

fn save_restore_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("checkpoint_save_restore");

    for rows in [1_024usize, 16_384].iter() {
        let synthetic = SyntheticConfig {
            rows: *rows,
            cols: 64,
            ..Default::default()
        };
        let metadata = synthetic.metadata(1);
        let state = TrainState::initialize(&metadata, PrngKey::from_seed(1));
        let (state, metadata) = (&state, &metadata);
        group.throughput(Throughput::Bytes(state.num_params() * 4));

        group.bench_with_input(BenchmarkId::new("save", rows), rows, |b, _| {
            b.to_async(&rt).iter(|| async move {
                let dir = TempDir::new().unwrap();
                let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
                let checkpointer = create_checkpointer(
                    &bench_config(&dir),
                    storage,
                    Arc::new(LocalBarrier),
                    PreemptionNotice::new(),
                )
                .await
                .unwrap();
                checkpointer.save_final(100, state, metadata).await.unwrap();
                checkpointer.wait_until_finished().await.unwrap();
            });
        });

        // Setup: one committed checkpoint to restore from
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let (dir, storage) = (&dir, &storage);
        rt.block_on(async {
            let checkpointer = create_checkpointer(
                &bench_config(dir),
                storage.clone(),
                Arc::new(LocalBarrier),
                PreemptionNotice::new(),
            )
            .await
            .unwrap();
            checkpointer.save_final(100, state, metadata).await.unwrap();
            checkpointer.wait_until_finished().await.unwrap();
        });

        group.bench_with_input(BenchmarkId::new("restore", rows), rows, |b, _| {
            b.to_async(&rt).iter(|| async move {
                let checkpointer = create_checkpointer(
                    &bench_config(dir),
                    storage.clone(),
                    Arc::new(LocalBarrier),
                    PreemptionNotice::new(),
                )
                .await
                .unwrap();
                let restored = checkpointer
                    .get_model_states(metadata, PrngKey::from_seed(1))
                    .await
                    .unwrap();
                assert_eq!(restored.state.step, 100);
            });
        });
    }

    group.finish();
}

fn raw_storage_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("storage_write");
    let size = 4_000_000;
    group.throughput(Throughput::Bytes(size as u64));

    group.bench_function("local_4MB", |b| {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        let data = Bytes::from(vec![0u8; size]);
        let (storage, data) = (&storage, &data);
        b.to_async(&rt).iter(|| async move {
            storage.write("bench/item.ckpt", data.clone()).await.unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    item_codec_benchmark,
    save_restore_benchmark,
    raw_storage_benchmark,
);
criterion_main!(benches);
