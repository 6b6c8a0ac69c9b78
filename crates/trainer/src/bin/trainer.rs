//! Trainer binary entry point
//!
//! Runs the synthetic regression programs under the full executor. Several
//! cooperating processes can be simulated as tasks sharing one job directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runtime_core::{
    Barrier, ExecutionMode, InMemoryBarrier, LocalBarrier, PreemptionNotice, RuntimeManager,
    TrainConfig,
};
use storage::{LocalStorage, StorageBackend};
use trainer::{
    synthetic_programs, EarlyStoppingPolicy, Executor, MonitoredMetric, Objective,
    PatienceEarlyStopping, RunOutcome, SyntheticConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Replicated,
    Sharded,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Replicated => ExecutionMode::Replicated,
            ModeArg::Sharded => ExecutionMode::Sharded,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "trainer", about = "Run the training loop on a synthetic regression task")]
struct Args {
    /// JSON training configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    job_log_dir: Option<PathBuf>,

    #[arg(long)]
    num_train_steps: Option<u64>,

    #[arg(long)]
    save_interval_steps: Option<u64>,

    #[arg(long)]
    eval_interval_steps: Option<u64>,

    #[arg(long)]
    decode_interval_steps: Option<u64>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Number of cooperating processes to simulate
    #[arg(long, default_value_t = 1)]
    processes: usize,

    /// Name of an eval input; repeat for several
    #[arg(long = "eval-input")]
    eval_inputs: Vec<String>,

    /// Name of a decode input; repeat for several
    #[arg(long = "decode-input")]
    decode_inputs: Vec<String>,

    /// Stop once the monitored loss fails to improve this many times in a row
    #[arg(long)]
    patience: Option<u32>,

    #[arg(long, default_value_t = 0.0)]
    min_delta: f64,

    #[arg(long, default_value_t = 16)]
    rows: usize,

    #[arg(long, default_value_t = 4)]
    cols: usize,

    #[arg(long, default_value_t = 0.1)]
    learning_rate: f32,

    /// Train without EMA variables
    #[arg(long)]
    no_ema: bool,
}

impl Args {
    fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TrainConfig::default(),
        };
        if let Some(dir) = &self.job_log_dir {
            config.job_log_dir = dir.clone();
        }
        if let Some(steps) = self.num_train_steps {
            config.num_train_steps = steps;
        }
        if let Some(steps) = self.save_interval_steps {
            config.save_interval_steps = steps;
        }
        if let Some(steps) = self.eval_interval_steps {
            config.eval_interval_steps = steps;
        }
        if let Some(steps) = self.decode_interval_steps {
            config.decode_interval_steps = steps;
        }
        if let Some(mode) = self.mode {
            config.execution_mode = mode.into();
        }
        config.validate()?;
        Ok(config)
    }

    fn synthetic_config(&self) -> SyntheticConfig {
        let defaults = SyntheticConfig::default();
        SyntheticConfig {
            rows: self.rows,
            cols: self.cols,
            learning_rate: self.learning_rate,
            ema_decay: if self.no_ema { None } else { defaults.ema_decay },
            ..defaults
        }
    }

    /// Watch the first eval input's loss, or the train loss without eval
    fn early_stopping(&self) -> Option<Box<dyn EarlyStoppingPolicy>> {
        let patience = self.patience?;
        let metric = match self.eval_inputs.first() {
            Some(input) => MonitoredMetric::Eval {
                input: input.clone(),
                name: "loss".to_string(),
            },
            None => MonitoredMetric::Train {
                name: "loss".to_string(),
            },
        };
        Some(Box::new(PatienceEarlyStopping::new(
            metric,
            Objective::Minimize,
            patience,
            self.min_delta,
        )))
    }
}

async fn run_processes(
    args: &Args,
    config: TrainConfig,
    preemption: PreemptionNotice,
) -> anyhow::Result<Vec<RunOutcome>> {
    anyhow::ensure!(args.processes > 0, "--processes must be at least 1");

    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.job_log_dir));
    let barriers: Vec<Arc<dyn Barrier>> = if args.processes == 1 {
        vec![Arc::new(LocalBarrier)]
    } else {
        InMemoryBarrier::new_group(args.processes, config.barrier_timeout)
            .into_iter()
            .map(|barrier| Arc::new(barrier) as Arc<dyn Barrier>)
            .collect()
    };

    let mut handles = Vec::with_capacity(barriers.len());
    for barrier in barriers {
        let group = barrier.group();
        let programs = synthetic_programs(
            args.synthetic_config(),
            config.execution_mode,
            group,
            &args.eval_inputs,
            &args.decode_inputs,
        )?;
        let mut executor = Executor::new(
            config.clone(),
            storage.clone(),
            barrier,
            preemption.clone(),
            programs.train,
        )
        .with_eval_programs(programs.eval)
        .with_decode_programs(programs.decode);
        if let Some(policy) = args.early_stopping() {
            executor = executor.with_early_stopping(policy);
        }

        let span = tracing::info_span!("process", index = group.process_index);
        handles.push(tokio::spawn(executor.run().instrument(span)));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        let outcome = handle
            .await
            .with_context(|| format!("process {index} panicked"))?
            .with_context(|| format!("process {index} failed"))?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trainer=info,checkpoint=info,runtime_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.train_config()?;
    tracing::info!(
        job_log_dir = %config.job_log_dir.display(),
        mode = ?config.execution_mode,
        processes = args.processes,
        "Starting trainer"
    );

    let runtime = RuntimeManager::new(config.clone())?;
    let _listener = runtime.spawn_preemption_listener()?;
    let outcomes = runtime.block_on(run_processes(&args, config, runtime.preemption()))??;

    let code = outcomes
        .iter()
        .map(RunOutcome::exit_code)
        .max()
        .unwrap_or(0);
    if let Some(outcome) = outcomes.first() {
        tracing::info!(
            reason = %outcome.reason,
            final_step = outcome.final_step,
            final_checkpoint_step = ?outcome.final_checkpoint_step,
            exit_code = code,
            "Trainer finished"
        );
    }

    runtime.shutdown();
    drop(runtime);
    std::process::exit(code);
}
