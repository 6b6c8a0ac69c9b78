//! Training loop orchestration
//!
//! Drives a train program and its eval/decode companions through a fixed
//! per-iteration order, with periodic asynchronous checkpointing, summary
//! sinks, early stopping and preemption handling.
//!
//! # Example
//!
//! ```ignore
//! use trainer::{synthetic_programs, Executor, SyntheticConfig};
//!
//! let programs = synthetic_programs(SyntheticConfig::default(), mode, group, &[], &[])?;
//! let outcome = Executor::new(config, storage, barrier, preemption, programs.train)
//!     .run()
//!     .await?;
//! std::process::exit(outcome.exit_code());
//! ```

pub mod early_stopping;
pub mod orchestrator;
pub mod program;
pub mod summary;
pub mod synthetic;

pub use early_stopping::{
    is_last_checkpoint, EarlyStoppingInput, EarlyStoppingPolicy, MonitoredMetric, Objective,
    PatienceEarlyStopping,
};
pub use orchestrator::{
    Executor, RunOutcome, SteadyState, SteadyStateReport, StopReason, PROVENANCE_FILE,
};
pub use program::{
    check_unique_names, DecodeMetrics, DecodeProgram, EvalMetrics, EvalProgram, Metrics,
    ProgramOutput, SetupOnce, SubProgramOutput, SubProgramSetup, TrainAux, TrainProgram,
    TrainProgramSetup, WeightedScalars,
};
pub use summary::{summary_dir_names, SummaryHandle, SummaryScope, SummaryWriter, EVENTS_FILE};
pub use synthetic::{
    synthetic_programs, SyntheticConfig, SyntheticDecodeProgram, SyntheticEvalProgram,
    SyntheticModel, SyntheticPrograms, SyntheticTrainProgram,
};
