//! Program contracts driven by the executor
//!
//! A train program advances the state by one invocation. Eval and decode
//! programs read a snapshot of the state and report metrics. Every program
//! is set up exactly once before its first run and never writes checkpoints.

use async_trait::async_trait;
use runtime_core::{Error, Result, SeedStream, Step, TrainState, TrainStateMetadata};
use std::collections::{BTreeMap, HashSet};

use crate::summary::SummaryHandle;

/// Named scalar values
pub type Metrics = BTreeMap<String, f64>;

/// Scalar name to `(value, weight)`
pub type WeightedScalars = BTreeMap<String, (f64, f64)>;

/// Side results of one train invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainAux {
    /// Step counter after the invocation
    pub new_step: Step,
    pub weighted_scalars: WeightedScalars,
    pub steps_per_sec: f64,
    /// Metrics on a held-out train batch, when computed this step
    pub eval_train_metrics: Option<Metrics>,
}

/// Result contract of a train invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramOutput {
    pub state: TrainState,
    pub aux: TrainAux,
}

/// Metrics of one round over every registered eval input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalMetrics {
    pub metrics_list: Vec<Metrics>,
    pub steps_per_sec: f64,
    pub input_names: Vec<String>,
}

impl EvalMetrics {
    /// Metrics of the input called `name`
    pub fn for_input(&self, name: &str) -> Option<&Metrics> {
        self.input_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.metrics_list.get(i))
    }
}

/// Metrics of one round over every registered decode input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeMetrics {
    pub metrics_list: Vec<Metrics>,
    pub input_names: Vec<String>,
}

impl DecodeMetrics {
    pub fn for_input(&self, name: &str) -> Option<&Metrics> {
        self.input_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.metrics_list.get(i))
    }
}

/// What a train program is bound to at setup
pub struct TrainProgramSetup {
    pub seeds: SeedStream,
    pub initial_step: Step,
    pub num_train_steps: Step,
    pub summary_interval_steps: Step,
    pub eval_interval_steps: Step,
    pub summary: SummaryHandle,
    pub eval_train_summary: SummaryHandle,
}

/// What an eval or decode program is bound to at setup
pub struct SubProgramSetup {
    pub seeds: SeedStream,
    pub summary: SummaryHandle,
}

/// Output of one eval or decode invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubProgramOutput {
    pub metrics: Metrics,
    /// Number of inner steps or examples processed
    pub num_steps: u64,
}

#[async_trait]
pub trait TrainProgram: Send {
    /// Static shape and placement of the state this program trains
    fn metadata(&self) -> TrainStateMetadata;

    /// Whether the state carries EMA variables
    fn has_ema(&self) -> bool;

    async fn setup(&mut self, setup: TrainProgramSetup) -> Result<()>;

    /// False once `step` has reached the configured horizon
    fn should_run(&self, state: &TrainState, step: Step) -> bool;

    /// Advance `state`; the returned state is the only channel of change
    async fn run(&mut self, state: &TrainState, step: Step) -> Result<ProgramOutput>;
}

#[async_trait]
pub trait EvalProgram: Send {
    /// Name of the input this program evaluates
    fn input_name(&self) -> &str;

    async fn setup(&mut self, setup: SubProgramSetup) -> Result<()>;

    async fn run(&mut self, state: &TrainState, step: Step) -> Result<SubProgramOutput>;
}

#[async_trait]
pub trait DecodeProgram: Send {
    fn input_name(&self) -> &str;

    async fn setup(&mut self, setup: SubProgramSetup) -> Result<()>;

    async fn run(&mut self, state: &TrainState, step: Step) -> Result<SubProgramOutput>;
}

/// Reject duplicate input names among programs of one kind
pub fn check_unique_names<'a>(kind: &str, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::DuplicateInputName {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Setup-once guard shared by program implementations
#[derive(Debug)]
pub struct SetupOnce<T> {
    program: &'static str,
    bound: Option<T>,
}

impl<T> SetupOnce<T> {
    pub fn new(program: &'static str) -> Self {
        Self {
            program,
            bound: None,
        }
    }

    pub fn bind(&mut self, value: T) -> Result<()> {
        if self.bound.is_some() {
            return Err(Error::Internal {
                message: format!("{} set up twice", self.program),
            });
        }
        self.bound = Some(value);
        Ok(())
    }

    pub fn get(&self) -> Result<&T> {
        self.bound.as_ref().ok_or_else(|| Error::ProgramNotSetUp {
            program: self.program.to_string(),
        })
    }

    pub fn get_mut(&mut self) -> Result<&mut T> {
        let program = self.program;
        self.bound.as_mut().ok_or_else(|| Error::ProgramNotSetUp {
            program: program.to_string(),
        })
    }
}
