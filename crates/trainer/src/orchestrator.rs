//! Training loop executor
//!
//! Each iteration runs in a fixed order:
//!
//! 1. save if the schedule asks for it
//! 2. stop on preemption when proactive exit is configured
//! 3. stop once the step horizon is reached
//! 4. run one train invocation, which owns the step increment
//! 5. run eval programs on the updated state when due
//! 6. run decode programs (optionally on the EMA view) when due
//! 7. ask the early stopping policy
//!
//! A stopped loop always ends with a final save and a drain of pending writes.

use checkpoint::{create_checkpointer, TrainingCheckpointer};
use runtime_core::{
    Barrier, CheckpointType, Error, PreemptionNotice, Result, RunSeeds, RunningMode,
    StateProvenance, Step, TrainConfig, TrainState, TrainStateMetadata,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::StorageBackend;
use tracing::{debug, error, info, warn};

use crate::early_stopping::{is_last_checkpoint, EarlyStoppingInput, EarlyStoppingPolicy};
use crate::program::{
    check_unique_names, DecodeMetrics, DecodeProgram, EvalMetrics, EvalProgram, SubProgramSetup,
    TrainProgram, TrainProgramSetup,
};
use crate::summary::SummaryScope;

/// Written by the primary process into the job log directory
pub const PROVENANCE_FILE: &str = "train_state_provenance.json";

/// Deferred save failures tolerated in a row before the loop aborts
const MAX_CONSECUTIVE_SAVE_FAILURES: u32 = 2;

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    EarlyStop,
    Preempted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::EarlyStop => write!(f, "early_stop"),
            StopReason::Preempted => write!(f, "preempted"),
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub initial_step: Step,
    pub final_step: Step,
    /// Number of train invocations executed by this run
    pub train_steps_run: u64,
    pub final_checkpoint_step: Option<Step>,
}

impl RunOutcome {
    /// Process exit status: 1 for a proactive preemption exit, 0 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.reason {
            StopReason::Preempted => 1,
            StopReason::Completed | StopReason::EarlyStop => 0,
        }
    }
}

/// Explicit bracket around the hot loop
#[derive(Debug)]
pub struct SteadyState {
    started: Instant,
    start_step: Step,
}

/// Throughput of one steady-state period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteadyStateReport {
    pub steps: u64,
    pub elapsed: Duration,
    pub steps_per_sec: f64,
}

impl SteadyState {
    pub fn begin(step: Step) -> Self {
        debug!(step, "Entering steady state");
        Self {
            started: Instant::now(),
            start_step: step,
        }
    }

    pub fn end(self, step: Step) -> SteadyStateReport {
        let elapsed = self.started.elapsed();
        let steps = step.saturating_sub(self.start_step);
        let report = SteadyStateReport {
            steps,
            elapsed,
            steps_per_sec: steps as f64 / elapsed.as_secs_f64().max(1e-9),
        };
        info!(
            steps,
            elapsed_ms = elapsed.as_millis() as u64,
            steps_per_sec = report.steps_per_sec,
            "Leaving steady state"
        );
        report
    }
}

#[derive(Serialize)]
struct ProvenanceRecord<'a> {
    provenance: &'a StateProvenance,
    initial_step: Step,
    total_num_params: u64,
    checkpoint_type: CheckpointType,
    process_count: usize,
}

/// Where the loop left off
struct LoopEnd {
    reason: StopReason,
    step: Step,
    state: TrainState,
    train_steps_run: u64,
}

fn interval_due(interval: Step, step: Step) -> bool {
    interval > 0 && step % interval == 0
}

/// Drives the programs of one process through the training loop
pub struct Executor {
    config: TrainConfig,
    storage: Arc<dyn StorageBackend>,
    barrier: Arc<dyn Barrier>,
    preemption: PreemptionNotice,
    train: Box<dyn TrainProgram>,
    eval: Vec<Box<dyn EvalProgram>>,
    decode: Vec<Box<dyn DecodeProgram>>,
    early_stopping: Option<Box<dyn EarlyStoppingPolicy>>,
}

impl Executor {
    /// `storage` must be rooted at `config.job_log_dir`
    pub fn new(
        config: TrainConfig,
        storage: Arc<dyn StorageBackend>,
        barrier: Arc<dyn Barrier>,
        preemption: PreemptionNotice,
        train: Box<dyn TrainProgram>,
    ) -> Self {
        Self {
            config,
            storage,
            barrier,
            preemption,
            train,
            eval: Vec::new(),
            decode: Vec::new(),
            early_stopping: None,
        }
    }

    pub fn with_eval_programs(mut self, programs: Vec<Box<dyn EvalProgram>>) -> Self {
        self.eval.extend(programs);
        self
    }

    pub fn with_decode_programs(mut self, programs: Vec<Box<dyn DecodeProgram>>) -> Self {
        self.decode.extend(programs);
        self
    }

    pub fn with_early_stopping(mut self, policy: Box<dyn EarlyStoppingPolicy>) -> Self {
        self.early_stopping = Some(policy);
        self
    }

    /// Configuration problems that must abort before any state is touched
    fn check_programs(&self) -> Result<()> {
        check_unique_names("eval", self.eval.iter().map(|p| p.input_name()))?;
        check_unique_names("decode", self.decode.iter().map(|p| p.input_name()))?;
        if self.config.decode_use_ema_states
            && !self.decode.is_empty()
            && !(self.train.has_ema() && self.train.metadata().has_ema)
        {
            return Err(Error::EmaUnavailable);
        }
        Ok(())
    }

    /// Restore or initialize, set up every program, then loop until stopped
    pub async fn run(mut self) -> Result<RunOutcome> {
        self.config.validate()?;
        self.check_programs()?;

        let group = self.barrier.group();
        let metadata = self.train.metadata();
        let seeds = RunSeeds::derive(
            self.config.random_seed,
            self.config.execution_mode,
            group.process_index,
        );

        let checkpointer = create_checkpointer(
            &self.config,
            self.storage.clone(),
            self.barrier.clone(),
            self.preemption.clone(),
        )
        .await?;
        let restored = checkpointer.get_model_states(&metadata, seeds.init).await?;

        let initial_step = restored.state.step;
        info!(initial_step, "Model initial global step");
        if let Some(expected) = checkpointer.step_to_restore() {
            if expected != initial_step {
                return Err(Error::RestoredStepMismatch {
                    expected,
                    actual: initial_step,
                });
            }
        }

        let provenance_json = serde_json::to_string_pretty(&ProvenanceRecord {
            provenance: &restored.provenance,
            initial_step,
            total_num_params: restored.total_num_params,
            checkpoint_type: checkpointer.checkpoint_type(),
            process_count: group.process_count,
        })?;
        if group.is_primary() {
            self.storage
                .write(PROVENANCE_FILE, provenance_json.clone().into())
                .await?;
        }

        let mut scope = SummaryScope::new(self.config.summary_dir(), group.is_primary());
        let train_summary = scope.acquire("train")?;
        let eval_train_summary = scope.acquire("eval_train")?;

        self.train
            .setup(TrainProgramSetup {
                seeds: seeds.train,
                initial_step,
                num_train_steps: self.config.num_train_steps,
                summary_interval_steps: self.config.summary_interval_steps,
                eval_interval_steps: self.config.eval_interval_steps,
                summary: train_summary.clone(),
                eval_train_summary,
            })
            .await?;
        for (index, program) in self.eval.iter_mut().enumerate() {
            let summary = scope.acquire(&format!("eval_test_{}", program.input_name()))?;
            program
                .setup(SubProgramSetup {
                    seeds: seeds.eval.fork(index),
                    summary,
                })
                .await?;
        }
        for (index, program) in self.decode.iter_mut().enumerate() {
            let summary = scope.acquire(&format!("decode_test_{}", program.input_name()))?;
            program
                .setup(SubProgramSetup {
                    seeds: seeds.decode.fork(index),
                    summary,
                })
                .await?;
        }

        train_summary.write_scalar(
            initial_step,
            "total_num_params",
            restored.total_num_params as f64,
        )?;
        train_summary.write_text(initial_step, "train_state_provenance", &provenance_json)?;

        self.barrier
            .wait(&format!("train_loop:start:{initial_step}"))
            .await?;
        info!(
            initial_step,
            num_train_steps = self.config.num_train_steps,
            "Training loop starting"
        );

        let steady = SteadyState::begin(initial_step);
        let looped = self
            .train_loop(
                checkpointer.as_ref(),
                &metadata,
                restored.state,
                initial_step,
                restored.total_num_params,
            )
            .await;
        let LoopEnd {
            reason,
            step,
            state,
            train_steps_run,
        } = match looped {
            Ok(end) => end,
            Err(e) => {
                if let Err(pending) = checkpointer.wait_until_finished().await {
                    warn!(error = %pending, "Pending checkpoint failed while aborting");
                }
                return Err(e);
            }
        };
        steady.end(step);

        let saved = checkpointer.save_final(step, &state, &metadata).await;
        let drained = checkpointer.wait_until_finished().await;
        saved?;
        drained?;
        let final_checkpoint_step = checkpointer.latest_step();

        train_summary.write_text(step, "stop_reason", &reason.to_string())?;
        scope.release()?;

        let outcome = RunOutcome {
            reason,
            initial_step,
            final_step: step,
            train_steps_run,
            final_checkpoint_step,
        };
        info!(
            reason = %outcome.reason,
            final_step = outcome.final_step,
            final_checkpoint_step = ?outcome.final_checkpoint_step,
            train_steps_run = outcome.train_steps_run,
            "Training loop finished"
        );
        Ok(outcome)
    }

    /// Iterate until a stop condition holds. Every exit, including errors, is
    /// followed by a drain of the checkpointer in `run`.
    async fn train_loop(
        &mut self,
        checkpointer: &dyn TrainingCheckpointer,
        metadata: &TrainStateMetadata,
        mut state: TrainState,
        initial_step: Step,
        total_num_params: u64,
    ) -> Result<LoopEnd> {
        let mut step = initial_step;
        let mut train_steps_run = 0u64;
        let mut failed_saves = 0u32;
        let mut last_committed = checkpointer.latest_step();

        let reason = loop {
            debug!(step, "Iteration begins");

            if checkpointer.latest_step() > last_committed {
                last_committed = checkpointer.latest_step();
                failed_saves = 0;
            }
            if let Err(e) = checkpointer.check_for_errors() {
                failed_saves += 1;
                error!(step, error = %e, failed_saves, "Checkpoint save failed");
                if failed_saves >= MAX_CONSECUTIVE_SAVE_FAILURES {
                    return Err(e);
                }
            }

            checkpointer.save_if_needed(step, &state, metadata).await?;

            if self.config.exit_after_ondemand_checkpoint
                && checkpointer.reached_preemption(step).await?
            {
                warn!(step, "Exiting after on-demand checkpoint");
                break StopReason::Preempted;
            }

            if step >= self.config.num_train_steps || !self.train.should_run(&state, step) {
                info!(
                    step,
                    num_train_steps = self.config.num_train_steps,
                    "Training loop completed"
                );
                break StopReason::Completed;
            }

            let output = self.train.run(&state, step).await?;
            if output.aux.new_step <= step {
                return Err(Error::Internal {
                    message: format!(
                        "train program did not advance the step ({} -> {})",
                        step, output.aux.new_step
                    ),
                });
            }
            state = output.state;
            let aux = output.aux;
            step = aux.new_step;
            train_steps_run += 1;

            let eval_metrics = if interval_due(self.config.eval_interval_steps, step)
                && !self.eval.is_empty()
            {
                Some(self.run_evals(&state, step).await?)
            } else {
                None
            };

            let decode_metrics = if interval_due(self.config.decode_interval_steps, step)
                && !self.decode.is_empty()
            {
                Some(self.run_decodes(&state, step).await?)
            } else {
                None
            };

            debug!(step = step - 1, "Iteration ends");

            let local_stop = match self.early_stopping.as_mut() {
                Some(policy) => {
                    let mode =
                        RunningMode::detect(true, eval_metrics.is_some(), decode_metrics.is_some());
                    let input = EarlyStoppingInput {
                        step,
                        is_last_ckpt: is_last_checkpoint(
                            mode,
                            step,
                            self.config.num_train_steps,
                            self.config.eval_interval_steps,
                            self.config.decode_interval_steps,
                            self.config.save_interval_steps,
                            policy.train_to_end(),
                        ),
                        train_weighted_scalars: &aux.weighted_scalars,
                        eval_train_metrics: aux.eval_train_metrics.as_ref(),
                        eval_metrics: eval_metrics.as_ref(),
                        decode_metrics: decode_metrics.as_ref(),
                        train_steps_per_sec: aux.steps_per_sec,
                        num_params: total_num_params,
                    };
                    policy.should_stop(&input)
                }
                None => false,
            };
            // Processes see different metrics; stop together if any of them asks to.
            if self
                .barrier
                .any(&format!("early_stop:{step}"), local_stop)
                .await?
            {
                info!(
                    step,
                    local = local_stop,
                    num_train_steps = self.config.num_train_steps,
                    "Training loop early stopped"
                );
                break StopReason::EarlyStop;
            }
        };

        Ok(LoopEnd {
            reason,
            step,
            state,
            train_steps_run,
        })
    }

    async fn run_evals(&mut self, state: &TrainState, step: Step) -> Result<EvalMetrics> {
        let started = Instant::now();
        let mut metrics = EvalMetrics::default();
        let mut num_steps = 0u64;
        for program in self.eval.iter_mut() {
            let output = program.run(state, step).await?;
            num_steps += output.num_steps;
            metrics.metrics_list.push(output.metrics);
            metrics.input_names.push(program.input_name().to_string());
        }
        let elapsed = started.elapsed();
        metrics.steps_per_sec = num_steps as f64 / elapsed.as_secs_f64().max(1e-9);
        debug!(step, elapsed_ms = elapsed.as_millis() as u64, "Eval round complete");
        Ok(metrics)
    }

    async fn run_decodes(&mut self, state: &TrainState, step: Step) -> Result<DecodeMetrics> {
        let ema_state;
        let decode_state = if self.config.decode_use_ema_states {
            ema_state = state.extract_ema()?;
            debug!(step, "Decoding with EMA states");
            &ema_state
        } else {
            state
        };

        let mut metrics = DecodeMetrics::default();
        for program in self.decode.iter_mut() {
            let output = program.run(decode_state, step).await?;
            metrics.metrics_list.push(output.metrics);
            metrics.input_names.push(program.input_name().to_string());
        }
        Ok(metrics)
    }
}
