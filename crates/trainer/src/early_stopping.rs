//! Early stopping policies and the last-checkpoint predicate

use runtime_core::{RunningMode, Step};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::program::{DecodeMetrics, EvalMetrics, Metrics, WeightedScalars};

/// Everything a policy may look at after one iteration
#[derive(Debug, Clone, Copy)]
pub struct EarlyStoppingInput<'a> {
    pub step: Step,
    /// No later checkpointed step exists under the configured intervals
    pub is_last_ckpt: bool,
    pub train_weighted_scalars: &'a WeightedScalars,
    pub eval_train_metrics: Option<&'a Metrics>,
    pub eval_metrics: Option<&'a EvalMetrics>,
    pub decode_metrics: Option<&'a DecodeMetrics>,
    pub train_steps_per_sec: f64,
    pub num_params: u64,
}

/// Decides after each iteration whether the run should stop
pub trait EarlyStoppingPolicy: Send {
    fn should_stop(&mut self, input: &EarlyStoppingInput<'_>) -> bool;

    /// When true, only the step horizon counts as the last checkpoint
    fn train_to_end(&self) -> bool {
        false
    }
}

impl<F> EarlyStoppingPolicy for F
where
    F: FnMut(&EarlyStoppingInput<'_>) -> bool + Send,
{
    fn should_stop(&mut self, input: &EarlyStoppingInput<'_>) -> bool {
        self(input)
    }
}

fn gcd(a: Step, b: Step) -> Step {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: Step, b: Step) -> Step {
    if a == 0 || b == 0 {
        a.max(b)
    } else {
        a / gcd(a, b) * b
    }
}

/// Whether `step` is the last step at which a checkpoint will be taken.
///
/// Unless `train_to_end`, the step is last once no multiple of the combined
/// save/eval/decode cadence fits before `num_train_steps`. Disabled (zero)
/// intervals do not contribute to the cadence.
pub fn is_last_checkpoint(
    mode: RunningMode,
    step: Step,
    num_train_steps: Step,
    eval_interval_steps: Step,
    decode_interval_steps: Step,
    save_interval_steps: Step,
    train_to_end: bool,
) -> bool {
    if train_to_end {
        return step >= num_train_steps;
    }
    let mut factor = 1;
    if mode.has_eval() {
        factor = lcm(factor, eval_interval_steps);
    }
    if mode.has_decode() {
        factor = lcm(factor, decode_interval_steps);
    }
    factor = lcm(factor, save_interval_steps);
    step >= num_train_steps || step.saturating_add(factor) > num_train_steps
}

/// Where the monitored value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MonitoredMetric {
    Train { name: String },
    Eval { input: String, name: String },
    Decode { input: String, name: String },
}

impl MonitoredMetric {
    fn read(&self, input: &EarlyStoppingInput<'_>) -> Option<f64> {
        match self {
            MonitoredMetric::Train { name } => {
                input.train_weighted_scalars.get(name).map(|(value, _)| *value)
            }
            MonitoredMetric::Eval { input: source, name } => input
                .eval_metrics
                .and_then(|m| m.for_input(source))
                .and_then(|m| m.get(name).copied()),
            MonitoredMetric::Decode { input: source, name } => input
                .decode_metrics
                .and_then(|m| m.for_input(source))
                .and_then(|m| m.get(name).copied()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    #[default]
    Minimize,
    Maximize,
}

/// Stop after `patience` consecutive observations without improvement
#[derive(Debug, Clone)]
pub struct PatienceEarlyStopping {
    metric: MonitoredMetric,
    objective: Objective,
    patience: u32,
    min_delta: f64,
    best: Option<f64>,
    stale: u32,
}

impl PatienceEarlyStopping {
    pub fn new(metric: MonitoredMetric, objective: Objective, patience: u32, min_delta: f64) -> Self {
        Self {
            metric,
            objective,
            patience,
            min_delta: min_delta.abs(),
            best: None,
            stale: 0,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    fn improves(&self, value: f64) -> bool {
        match (self.best, self.objective) {
            (None, _) => true,
            (Some(best), Objective::Minimize) => value < best - self.min_delta,
            (Some(best), Objective::Maximize) => value > best + self.min_delta,
        }
    }
}

impl EarlyStoppingPolicy for PatienceEarlyStopping {
    fn should_stop(&mut self, input: &EarlyStoppingInput<'_>) -> bool {
        let Some(value) = self.metric.read(input) else {
            return false;
        };
        if self.improves(value) {
            self.best = Some(value);
            self.stale = 0;
            return false;
        }
        self.stale += 1;
        if self.stale >= self.patience {
            info!(
                step = input.step,
                value,
                best = ?self.best,
                patience = self.patience,
                "Monitored metric stopped improving"
            );
            return true;
        }
        false
    }
}
