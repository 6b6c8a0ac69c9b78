//! End-to-end training loop tests
//!
//! Runs the synthetic programs through the full executor against a local job
//! directory, covering:
//! - loop termination and resumption from the newest checkpoint
//! - early stopping and proactive preemption exits
//! - replicated and sharded layouts across simulated processes
//! - stop decisions shared by the whole group
//! - fatal configuration errors raised before the loop starts

use anyhow::Result;
use bytes::Bytes;
use checkpoint::checkpointer::{shard_item, REPLICATED_ITEM};
use checkpoint::decode_item;
use checkpoint::manager::{step_dir, COMMIT_FILE};
use runtime_core::{
    Barrier, Error, ExecutionMode, InMemoryBarrier, LocalBarrier, PreemptionNotice, TrainConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;
use trainer::{
    synthetic_programs, EarlyStoppingInput, Executor, MonitoredMetric, Objective,
    PatienceEarlyStopping, RunOutcome, StopReason, SyntheticConfig, PROVENANCE_FILE,
};

fn job_config(dir: &Path, num_train_steps: u64) -> TrainConfig {
    TrainConfig {
        job_log_dir: dir.to_path_buf(),
        num_train_steps,
        save_interval_steps: 5,
        summary_interval_steps: 5,
        barrier_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

/// One simulated process of a job
struct SimulatedProcess {
    config: TrainConfig,
    barrier: Arc<dyn Barrier>,
    preemption: PreemptionNotice,
    synthetic: SyntheticConfig,
    eval_inputs: Vec<String>,
    decode_inputs: Vec<String>,
}

impl SimulatedProcess {
    fn single(config: TrainConfig) -> Self {
        Self::with_barrier(config, Arc::new(LocalBarrier))
    }

    fn with_barrier(config: TrainConfig, barrier: Arc<dyn Barrier>) -> Self {
        Self {
            config,
            barrier,
            preemption: PreemptionNotice::new(),
            synthetic: SyntheticConfig::default(),
            eval_inputs: Vec::new(),
            decode_inputs: Vec::new(),
        }
    }

    fn executor(self) -> Result<Executor> {
        let programs = synthetic_programs(
            self.synthetic,
            self.config.execution_mode,
            self.barrier.group(),
            &self.eval_inputs,
            &self.decode_inputs,
        )?;
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(&self.config.job_log_dir));
        Ok(Executor::new(
            self.config,
            storage,
            self.barrier,
            self.preemption,
            programs.train,
        )
        .with_eval_programs(programs.eval)
        .with_decode_programs(programs.decode))
    }

    async fn run(self) -> Result<RunOutcome> {
        Ok(self.executor()?.run().await?)
    }
}

/// Run every process of a group concurrently
async fn run_group(config: &TrainConfig, process_count: usize, synthetic: SyntheticConfig) -> Result<Vec<RunOutcome>> {
    let handles: Vec<_> = InMemoryBarrier::new_group(process_count, config.barrier_timeout)
        .into_iter()
        .map(|barrier| {
            let mut process = SimulatedProcess::with_barrier(config.clone(), Arc::new(barrier));
            process.synthetic = synthetic.clone();
            tokio::spawn(process.run())
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }
    Ok(outcomes)
}

fn read_item(dir: &Path, step: u64, item: &str) -> Result<Bytes> {
    let path = dir.join(step_dir(step)).join(item);
    Ok(Bytes::from(std::fs::read(path)?))
}

fn summary_lines(dir: &Path, sink: &str) -> Result<Vec<serde_json::Value>> {
    let raw = std::fs::read_to_string(dir.join("summaries").join(sink).join("events.jsonl"))?;
    raw.lines()
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

#[tokio::test]
async fn test_loop_runs_remaining_steps_only() -> Result<()> {
    let dir = TempDir::new()?;
    let config = job_config(dir.path(), 12);

    let first = SimulatedProcess::single(config.clone()).run().await?;
    assert_eq!(first.reason, StopReason::Completed);
    assert_eq!(first.initial_step, 0);
    assert_eq!(first.train_steps_run, 12);
    assert_eq!(first.final_checkpoint_step, Some(12));
    assert!(dir.path().join(step_dir(12)).join(COMMIT_FILE).exists());

    // Nothing left to do at the horizon
    let second = SimulatedProcess::single(config).run().await?;
    assert_eq!(second.initial_step, 12);
    assert_eq!(second.train_steps_run, 0);
    assert_eq!(second.reason, StopReason::Completed);

    let provenance: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(PROVENANCE_FILE))?)?;
    assert_eq!(provenance["provenance"]["source"], "restored");
    assert_eq!(provenance["initial_step"], 12);
    Ok(())
}

#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_run() -> Result<()> {
    let straight = TempDir::new()?;
    SimulatedProcess::single(job_config(straight.path(), 20)).run().await?;

    let interrupted = TempDir::new()?;
    let first = SimulatedProcess::single(job_config(interrupted.path(), 10)).run().await?;
    assert_eq!(first.final_checkpoint_step, Some(10));
    let resumed = SimulatedProcess::single(job_config(interrupted.path(), 20)).run().await?;
    assert_eq!(resumed.initial_step, 10);
    assert_eq!(resumed.train_steps_run, 10);

    let (_, a) = decode_item(20, &read_item(straight.path(), 20, REPLICATED_ITEM)?)?;
    let (_, b) = decode_item(20, &read_item(interrupted.path(), 20, REPLICATED_ITEM)?)?;
    assert_eq!(a, b);
    Ok(())
}

#[tokio::test]
async fn test_early_stop_after_first_step_writes_final_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let config = TrainConfig {
        save_interval_steps: 100,
        ..job_config(dir.path(), 50)
    };

    let outcome = SimulatedProcess::single(config)
        .executor()?
        .with_early_stopping(Box::new(|input: &EarlyStoppingInput<'_>| input.step >= 1))
        .run()
        .await?;

    assert_eq!(outcome.reason, StopReason::EarlyStop);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.train_steps_run, 1);
    assert_eq!(outcome.final_checkpoint_step, Some(1));
    assert!(dir.path().join(step_dir(1)).join(COMMIT_FILE).exists());
    Ok(())
}

#[tokio::test]
async fn test_preemption_mid_run_saves_and_exits_nonzero() -> Result<()> {
    let dir = TempDir::new()?;
    let config = TrainConfig {
        exit_after_ondemand_checkpoint: true,
        ..job_config(dir.path(), 50)
    };

    let process = SimulatedProcess::single(config);
    let notice = process.preemption.clone();
    let outcome = process
        .executor()?
        .with_early_stopping(Box::new(move |input: &EarlyStoppingInput<'_>| {
            if input.step == 3 {
                notice.signal();
            }
            false
        }))
        .run()
        .await?;

    assert_eq!(outcome.reason, StopReason::Preempted);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.final_step, 3);
    assert_eq!(outcome.final_checkpoint_step, Some(3));
    Ok(())
}

#[tokio::test]
async fn test_preemption_ignored_without_proactive_exit() -> Result<()> {
    let dir = TempDir::new()?;
    let process = SimulatedProcess::single(job_config(dir.path(), 8));
    process.preemption.signal();

    let outcome = process.run().await?;
    assert_eq!(outcome.reason, StopReason::Completed);
    assert_eq!(outcome.final_step, 8);
    Ok(())
}

#[tokio::test]
async fn test_eval_and_decode_follow_their_intervals() -> Result<()> {
    let dir = TempDir::new()?;
    let config = TrainConfig {
        eval_interval_steps: 5,
        decode_interval_steps: 10,
        decode_use_ema_states: true,
        ..job_config(dir.path(), 20)
    };
    let mut process = SimulatedProcess::single(config);
    process.eval_inputs = vec!["test".to_string(), "dev".to_string()];
    process.decode_inputs = vec!["test".to_string()];
    process.run().await?;

    let eval_steps: Vec<u64> = summary_lines(dir.path(), "eval_test_dev")?
        .iter()
        .filter(|line| line["tag"] == "loss")
        .filter_map(|line| line["step"].as_u64())
        .collect();
    assert_eq!(eval_steps, vec![5, 10, 15, 20]);

    let decode_steps: Vec<u64> = summary_lines(dir.path(), "decode_test_test")?
        .iter()
        .filter(|line| line["tag"] == "decoded_row")
        .filter_map(|line| line["step"].as_u64())
        .collect();
    assert_eq!(decode_steps, vec![10, 20]);

    let train = summary_lines(dir.path(), "train")?;
    assert_eq!(train[0]["tag"], "total_num_params");
    assert_eq!(train[0]["step"], 0);
    Ok(())
}

#[tokio::test]
async fn test_replicated_group_writes_single_copy() -> Result<()> {
    let dir = TempDir::new()?;
    let config = job_config(dir.path(), 10);

    let outcomes = run_group(&config, 2, SyntheticConfig::default()).await?;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.final_checkpoint_step == Some(10)));

    let step_10 = dir.path().join(step_dir(10));
    assert!(step_10.join(REPLICATED_ITEM).exists());
    assert!(!step_10.join(shard_item(0, 2)).exists());
    Ok(())
}

#[tokio::test]
async fn test_sharded_group_writes_one_shard_per_process_and_resumes() -> Result<()> {
    let dir = TempDir::new()?;
    let synthetic = SyntheticConfig {
        rows: 15,
        ..Default::default()
    };
    let config = TrainConfig {
        execution_mode: ExecutionMode::Sharded,
        ..job_config(dir.path(), 10)
    };

    let outcomes = run_group(&config, 2, synthetic.clone()).await?;
    assert!(outcomes.iter().all(|o| o.reason == StopReason::Completed));

    for shard in 0..2 {
        let (header, _) = decode_item(10, &read_item(dir.path(), 10, &shard_item(shard, 2))?)?;
        assert_eq!(header.shard_index as usize, shard);
        assert_eq!(header.num_shards, 2);
    }
    assert!(!dir.path().join(step_dir(10)).join(REPLICATED_ITEM).exists());

    let longer = TrainConfig {
        num_train_steps: 15,
        ..config
    };
    let resumed = run_group(&longer, 2, synthetic).await?;
    assert!(resumed.iter().all(|o| o.initial_step == 10 && o.final_step == 15));
    Ok(())
}

fn sharded_config(dir: &Path, num_train_steps: u64) -> TrainConfig {
    TrainConfig {
        execution_mode: ExecutionMode::Sharded,
        barrier_timeout: Duration::from_secs(10),
        ..job_config(dir, num_train_steps)
    }
}

async fn join_all(executors: Vec<Executor>) -> Result<Vec<RunOutcome>> {
    let handles: Vec<_> = executors
        .into_iter()
        .map(|executor| tokio::spawn(executor.run()))
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }
    Ok(outcomes)
}

#[tokio::test]
async fn test_preemption_seen_by_one_process_stops_the_group() -> Result<()> {
    let dir = TempDir::new()?;
    let config = TrainConfig {
        exit_after_ondemand_checkpoint: true,
        ..sharded_config(dir.path(), 50)
    };

    let mut executors = Vec::new();
    for barrier in InMemoryBarrier::new_group(2, config.barrier_timeout) {
        let mut process = SimulatedProcess::with_barrier(config.clone(), Arc::new(barrier));
        process.synthetic.rows = 15;
        let notice = process.preemption.clone();
        let signals = process.barrier.group().is_primary();
        let executor = process
            .executor()?
            .with_early_stopping(Box::new(move |input: &EarlyStoppingInput<'_>| {
                if signals && input.step == 7 {
                    notice.signal();
                }
                false
            }));
        executors.push(executor);
    }

    let outcomes = join_all(executors).await?;
    for outcome in &outcomes {
        assert_eq!(outcome.reason, StopReason::Preempted);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.final_step, 7);
        assert_eq!(outcome.final_checkpoint_step, Some(7));
    }
    assert!(dir.path().join(step_dir(7)).join(COMMIT_FILE).exists());
    assert!(dir.path().join(step_dir(7)).join(shard_item(1, 2)).exists());
    Ok(())
}

#[tokio::test]
async fn test_patience_stops_sharded_group_at_one_step() -> Result<()> {
    let dir = TempDir::new()?;
    let config = sharded_config(dir.path(), 50);
    let synthetic = SyntheticConfig {
        rows: 5,
        cols: 2,
        target_seed: 1,
        learning_rate: 0.02,
        ..Default::default()
    };

    let mut executors = Vec::new();
    for barrier in InMemoryBarrier::new_group(2, config.barrier_timeout) {
        let mut process = SimulatedProcess::with_barrier(config.clone(), Arc::new(barrier));
        process.synthetic = synthetic.clone();
        let policy = PatienceEarlyStopping::new(
            MonitoredMetric::Train {
                name: "loss".to_string(),
            },
            Objective::Minimize,
            1,
            0.01,
        );
        executors.push(process.executor()?.with_early_stopping(Box::new(policy)));
    }

    let outcomes = join_all(executors).await?;
    let final_step = outcomes[0].final_step;
    assert!(final_step < 50);
    for outcome in &outcomes {
        assert_eq!(outcome.reason, StopReason::EarlyStop);
        assert_eq!(outcome.final_step, final_step);
        assert_eq!(outcome.final_checkpoint_step, Some(final_step));
    }
    assert!(dir.path().join(step_dir(final_step)).join(COMMIT_FILE).exists());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_decode_names_are_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let mut process = SimulatedProcess::single(job_config(dir.path(), 5));
    process.decode_inputs = vec!["test".to_string(), "test".to_string()];

    let err = process.executor()?.run().await.unwrap_err();
    assert!(matches!(err, Error::DuplicateInputName { ref kind, .. } if kind == "decode"));
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn test_ema_decode_without_ema_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let config = TrainConfig {
        decode_use_ema_states: true,
        decode_interval_steps: 5,
        ..job_config(dir.path(), 5)
    };
    let mut process = SimulatedProcess::single(config);
    process.synthetic.ema_decay = None;
    process.decode_inputs = vec!["test".to_string()];

    let err = process.executor()?.run().await.unwrap_err();
    assert!(matches!(err, Error::EmaUnavailable));
    Ok(())
}

#[tokio::test]
async fn test_mismatched_checkpoint_type_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let config = TrainConfig {
        checkpoint_type: Some("sharded".to_string()),
        ..job_config(dir.path(), 5)
    };
    let err = SimulatedProcess::single(config).executor()?.run().await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedCheckpointType { .. }));
    Ok(())
}

#[tokio::test]
async fn test_same_seed_gives_same_eval_metrics() -> Result<()> {
    let mut sampled = Vec::new();
    for _ in 0..2 {
        let dir = TempDir::new()?;
        let config = TrainConfig {
            eval_interval_steps: 5,
            ..job_config(dir.path(), 10)
        };
        let mut process = SimulatedProcess::single(config);
        process.eval_inputs = vec!["test".to_string()];
        process.run().await?;

        let values: Vec<f64> = summary_lines(dir.path(), "eval_test_test")?
            .iter()
            .filter(|line| line["tag"] == "sampled_loss")
            .filter_map(|line| line["value"].as_f64())
            .collect();
        sampled.push(values);
    }
    assert_eq!(sampled[0].len(), 2);
    assert_eq!(sampled[0], sampled[1]);
    Ok(())
}
