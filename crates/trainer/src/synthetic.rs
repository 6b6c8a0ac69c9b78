//! Synthetic regression task used by the binary, tests and benchmarks.
//!
//! Every parameter is pulled towards a fixed target drawn from `target_seed`
//! with momentum SGD on a squared error. The objective is separable, so a
//! shard can be trained without seeing the others.

use async_trait::async_trait;
use rand::seq::index::sample;
use runtime_core::{
    Error, ExecutionMode, PrngKey, ProcessGroup, Result, SeedStream, Step, Tensor, TrainState,
    TrainStateMetadata, VarMap, VariableSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::program::{
    DecodeProgram, EvalProgram, Metrics, ProgramOutput, SetupOnce, SubProgramOutput,
    SubProgramSetup, TrainAux, TrainProgram, TrainProgramSetup, WeightedScalars,
};
use crate::summary::SummaryHandle;

/// Momentum accumulator name of a model variable
fn momentum_name(var: &str) -> String {
    format!("{var}/momentum")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Leading (sharded) dimension of the weight matrix
    pub rows: usize,
    pub cols: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    /// EMA decay; `None` trains without EMA variables
    pub ema_decay: Option<f32>,
    /// Elements sampled per step for the `sampled_loss` estimate
    pub sample_size: usize,
    pub target_seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            rows: 16,
            cols: 4,
            learning_rate: 0.1,
            momentum: 0.9,
            ema_decay: Some(0.99),
            sample_size: 8,
            target_seed: 7,
        }
    }
}

impl SyntheticConfig {
    pub fn metadata(&self, num_shards: usize) -> TrainStateMetadata {
        let mut variables = BTreeMap::new();
        variables.insert("w".to_string(), VariableSpec::sharded(&[self.rows, self.cols]));
        variables.insert("b".to_string(), VariableSpec::replicated(&[self.cols]));

        let opt_variables = variables
            .iter()
            .map(|(name, spec)| (momentum_name(name), spec.clone()))
            .collect();

        TrainStateMetadata {
            variables,
            opt_variables,
            has_ema: self.ema_decay.is_some(),
            num_shards,
        }
    }
}

/// This process's view of the task: targets and unpadded lengths of its slices
#[derive(Debug)]
pub struct SyntheticModel {
    config: SyntheticConfig,
    metadata: TrainStateMetadata,
    targets: VarMap,
    valid_lens: BTreeMap<String, usize>,
    sharded: bool,
    process_index: usize,
}

impl SyntheticModel {
    pub fn new(config: SyntheticConfig, mode: ExecutionMode, group: ProcessGroup) -> Result<Self> {
        if config.rows == 0 || config.cols == 0 {
            return Err(Error::invalid_config(
                "synthetic.rows",
                format!("{}x{}", config.rows, config.cols),
                "dimensions must be positive",
            ));
        }
        let sharded = mode == ExecutionMode::Sharded;
        let num_shards = if sharded { group.process_count } else { 1 };
        let metadata = config.metadata(num_shards);

        let target_meta = TrainStateMetadata {
            has_ema: false,
            ..metadata.clone()
        };
        let global = TrainState::initialize(&target_meta, PrngKey::from_seed(config.target_seed));
        let local = if sharded {
            global.local_shard(&target_meta, group.process_index)?
        } else {
            global
        };

        let valid_lens = metadata
            .variables
            .iter()
            .map(|(name, spec)| {
                let row_len: usize = spec.shape.iter().skip(1).product();
                let local_rows = spec.local_shape(num_shards)[0];
                let valid_rows = if sharded && spec.partition == runtime_core::PartitionSpec::Sharded {
                    let start = group.process_index * local_rows;
                    local_rows.min(spec.shape[0].saturating_sub(start))
                } else {
                    local_rows
                };
                (name.clone(), valid_rows * row_len)
            })
            .collect();

        Ok(Self {
            config,
            metadata,
            targets: local.mdl_vars,
            valid_lens,
            sharded,
            process_index: group.process_index,
        })
    }

    pub fn metadata(&self) -> &TrainStateMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Generator for this process's slice of a per-step key
    fn local_key(&self, key: PrngKey) -> PrngKey {
        if self.sharded {
            key.fold_in(self.process_index as u64)
        } else {
            key
        }
    }

    /// Unpadded `(values, targets)` slices per variable
    fn pairs<'a>(
        &'a self,
        vars: &'a VarMap,
    ) -> impl Iterator<Item = Result<(&'a [f32], &'a [f32])>> + 'a {
        self.targets.iter().map(move |(name, target)| {
            let tensor = vars.get(name).ok_or_else(|| Error::VariableNotFound {
                name: name.clone(),
            })?;
            let valid = self.valid_lens.get(name).copied().unwrap_or(0);
            Ok((
                &tensor.values[..valid.min(tensor.values.len())],
                &target.values[..valid.min(target.values.len())],
            ))
        })
    }

    /// Mean squared error and max absolute error over the unpadded elements
    pub fn errors(&self, vars: &VarMap) -> Result<(f64, f64)> {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        let mut max_abs = 0.0f64;
        for pair in self.pairs(vars) {
            let (values, targets) = pair?;
            for (v, t) in values.iter().zip(targets) {
                let diff = f64::from(*v - *t);
                sum += diff * diff;
                max_abs = max_abs.max(diff.abs());
                count += 1;
            }
        }
        Ok((sum / count.max(1) as f64, max_abs))
    }

    /// Squared error over `sample_size` elements drawn with `key`
    pub fn sampled_loss(&self, vars: &VarMap, key: PrngKey) -> Result<f64> {
        let mut diffs = Vec::new();
        for pair in self.pairs(vars) {
            let (values, targets) = pair?;
            diffs.extend(values.iter().zip(targets).map(|(v, t)| f64::from(*v - *t)));
        }
        if diffs.is_empty() {
            return Ok(0.0);
        }
        let mut rng = self.local_key(key).into_rng();
        let amount = self.config.sample_size.clamp(1, diffs.len());
        let picked = sample(&mut rng, diffs.len(), amount);
        Ok(picked.iter().map(|i| diffs[i] * diffs[i]).sum::<f64>() / amount as f64)
    }

    /// One momentum step towards the targets
    pub fn step(&self, state: &TrainState) -> Result<TrainState> {
        let mut next = state.clone();
        for (name, target) in &self.targets {
            let valid = self.valid_lens.get(name).copied().unwrap_or(0);
            let momentum_key = momentum_name(name);
            let w = next
                .mdl_vars
                .get_mut(name)
                .ok_or_else(|| Error::VariableNotFound { name: name.clone() })?;
            let m = next
                .opt_states
                .get_mut(&momentum_key)
                .ok_or_else(|| Error::VariableNotFound { name: momentum_key.clone() })?;
            if w.values.len() != m.values.len() || w.values.len() < valid {
                return Err(Error::ShapeMismatch {
                    name: name.clone(),
                    expected: w.shape.clone(),
                    actual: m.shape.clone(),
                });
            }

            for i in 0..valid {
                let grad = 2.0 * (w.values[i] - target.values[i]);
                m.values[i] = self.config.momentum * m.values[i] + grad;
                w.values[i] -= self.config.learning_rate * m.values[i];
            }
        }

        if let (Some(decay), Some(ema)) = (self.config.ema_decay, next.ema_vars.as_mut()) {
            for (name, tensor) in &next.mdl_vars {
                let average = ema
                    .entry(name.clone())
                    .or_insert_with(|| Tensor::zeros(&tensor.shape));
                for (e, w) in average.values.iter_mut().zip(&tensor.values) {
                    *e = decay * *e + (1.0 - decay) * *w;
                }
            }
        }

        next.step = state.step + 1;
        Ok(next)
    }
}

struct TrainBinding {
    seeds: SeedStream,
    num_train_steps: Step,
    summary_interval_steps: Step,
    eval_interval_steps: Step,
    summary: SummaryHandle,
    eval_train_summary: SummaryHandle,
    last_run: Instant,
}

/// Train program for [`SyntheticModel`]
pub struct SyntheticTrainProgram {
    model: Arc<SyntheticModel>,
    binding: SetupOnce<TrainBinding>,
}

impl SyntheticTrainProgram {
    pub fn new(model: Arc<SyntheticModel>) -> Self {
        Self {
            model,
            binding: SetupOnce::new("synthetic train"),
        }
    }
}

#[async_trait]
impl TrainProgram for SyntheticTrainProgram {
    fn metadata(&self) -> TrainStateMetadata {
        self.model.metadata().clone()
    }

    fn has_ema(&self) -> bool {
        self.model.config().ema_decay.is_some()
    }

    async fn setup(&mut self, setup: TrainProgramSetup) -> Result<()> {
        debug!(initial_step = setup.initial_step, "Synthetic train program set up");
        self.binding.bind(TrainBinding {
            seeds: setup.seeds,
            num_train_steps: setup.num_train_steps,
            summary_interval_steps: setup.summary_interval_steps,
            eval_interval_steps: setup.eval_interval_steps,
            summary: setup.summary,
            eval_train_summary: setup.eval_train_summary,
            last_run: Instant::now(),
        })
    }

    fn should_run(&self, _state: &TrainState, step: Step) -> bool {
        match self.binding.get() {
            Ok(binding) => step < binding.num_train_steps,
            Err(_) => false,
        }
    }

    async fn run(&mut self, state: &TrainState, step: Step) -> Result<ProgramOutput> {
        let model = self.model.clone();
        let binding = self.binding.get_mut()?;

        let next = model.step(state)?;
        let new_step = next.step;
        let (loss, _) = model.errors(&next.mdl_vars)?;
        let sampled = model.sampled_loss(&next.mdl_vars, binding.seeds.key_for_step(step))?;

        let now = Instant::now();
        let steps_per_sec = 1.0 / now.duration_since(binding.last_run).as_secs_f64().max(1e-9);
        binding.last_run = now;

        let mut weighted_scalars = WeightedScalars::new();
        let weight = model.valid_lens.values().sum::<usize>() as f64;
        weighted_scalars.insert("loss".to_string(), (loss, weight));
        weighted_scalars.insert("sampled_loss".to_string(), (sampled, 1.0));

        if binding.summary_interval_steps > 0 && new_step % binding.summary_interval_steps == 0 {
            binding.summary.write_scalar(new_step, "loss", loss)?;
            binding.summary.write_scalar(new_step, "sampled_loss", sampled)?;
            binding.summary.write_scalar(new_step, "steps_per_sec", steps_per_sec)?;
        }

        let eval_train_metrics = if binding.eval_interval_steps > 0
            && new_step % binding.eval_interval_steps == 0
        {
            let mut metrics = Metrics::new();
            metrics.insert("loss".to_string(), loss);
            binding.eval_train_summary.write_scalars(new_step, &metrics)?;
            Some(metrics)
        } else {
            None
        };

        Ok(ProgramOutput {
            state: next,
            aux: TrainAux {
                new_step,
                weighted_scalars,
                steps_per_sec,
                eval_train_metrics,
            },
        })
    }
}

/// Eval program reporting the distance to the targets
pub struct SyntheticEvalProgram {
    name: String,
    model: Arc<SyntheticModel>,
    binding: SetupOnce<SubProgramSetup>,
}

impl SyntheticEvalProgram {
    pub fn new(name: impl Into<String>, model: Arc<SyntheticModel>) -> Self {
        Self {
            name: name.into(),
            model,
            binding: SetupOnce::new("synthetic eval"),
        }
    }
}

#[async_trait]
impl EvalProgram for SyntheticEvalProgram {
    fn input_name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self, setup: SubProgramSetup) -> Result<()> {
        self.binding.bind(setup)
    }

    async fn run(&mut self, state: &TrainState, step: Step) -> Result<SubProgramOutput> {
        let binding = self.binding.get()?;
        let (loss, max_abs_error) = self.model.errors(&state.mdl_vars)?;
        let sampled = self
            .model
            .sampled_loss(&state.mdl_vars, binding.seeds.key_for_step(step))?;

        let mut metrics = Metrics::new();
        metrics.insert("loss".to_string(), loss);
        metrics.insert("max_abs_error".to_string(), max_abs_error);
        metrics.insert("sampled_loss".to_string(), sampled);
        binding.summary.write_scalars(step, &metrics)?;

        Ok(SubProgramOutput {
            metrics,
            num_steps: 1,
        })
    }
}

/// Decode program emitting the first decoded row as text
pub struct SyntheticDecodeProgram {
    name: String,
    model: Arc<SyntheticModel>,
    binding: SetupOnce<SubProgramSetup>,
}

impl SyntheticDecodeProgram {
    pub fn new(name: impl Into<String>, model: Arc<SyntheticModel>) -> Self {
        Self {
            name: name.into(),
            model,
            binding: SetupOnce::new("synthetic decode"),
        }
    }
}

#[async_trait]
impl DecodeProgram for SyntheticDecodeProgram {
    fn input_name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self, setup: SubProgramSetup) -> Result<()> {
        self.binding.bind(setup)
    }

    async fn run(&mut self, state: &TrainState, step: Step) -> Result<SubProgramOutput> {
        let binding = self.binding.get()?;
        let (_, max_abs_error) = self.model.errors(&state.mdl_vars)?;
        let w = state
            .mdl_vars
            .get("w")
            .ok_or_else(|| Error::VariableNotFound { name: "w".to_string() })?;
        let cols = self.model.config().cols.min(w.values.len());
        let decoded: Vec<String> = w.values[..cols].iter().map(|v| format!("{v:.4}")).collect();
        binding
            .summary
            .write_text(step, "decoded_row", &decoded.join(" "))?;

        let mut metrics = Metrics::new();
        metrics.insert("max_abs_error".to_string(), max_abs_error);
        metrics.insert("num_decoded".to_string(), 1.0);
        binding.summary.write_scalars(step, &metrics)?;

        Ok(SubProgramOutput {
            metrics,
            num_steps: 1,
        })
    }
}

/// Programs of one process
pub struct SyntheticPrograms {
    pub train: Box<dyn TrainProgram>,
    pub eval: Vec<Box<dyn EvalProgram>>,
    pub decode: Vec<Box<dyn DecodeProgram>>,
}

/// Build the train program plus one eval/decode program per input name
pub fn synthetic_programs(
    config: SyntheticConfig,
    mode: ExecutionMode,
    group: ProcessGroup,
    eval_inputs: &[String],
    decode_inputs: &[String],
) -> Result<SyntheticPrograms> {
    let model = Arc::new(SyntheticModel::new(config, mode, group)?);
    Ok(SyntheticPrograms {
        train: Box::new(SyntheticTrainProgram::new(model.clone())),
        eval: eval_inputs
            .iter()
            .map(|name| Box::new(SyntheticEvalProgram::new(name.clone(), model.clone())) as Box<dyn EvalProgram>)
            .collect(),
        decode: decode_inputs
            .iter()
            .map(|name| {
                Box::new(SyntheticDecodeProgram::new(name.clone(), model.clone())) as Box<dyn DecodeProgram>
            })
            .collect(),
    })
}
