//! Train state and its static shape/placement metadata

use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rng::PrngKey;
use crate::types::{ProcessIndex, Step};
use crate::{Error, Result};

/// Dense f32 tensor in row-major order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected = num_elements(&shape);
        if expected != values.len() {
            return Err(Error::ShapeMismatch {
                name: "<tensor>".to_string(),
                expected: shape,
                actual: vec![values.len()],
            });
        }
        Ok(Self { shape, values })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            values: vec![0.0; num_elements(shape)],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rows `[start, start + rows)` of the leading axis, zero-padded past the end
    fn rows(&self, start: usize, rows: usize) -> Tensor {
        let row_len = row_len(&self.shape);
        let total_rows = self.shape.first().copied().unwrap_or(1);
        let mut values = vec![0.0; rows * row_len];
        for r in 0..rows {
            let src = start + r;
            if src < total_rows {
                values[r * row_len..(r + 1) * row_len]
                    .copy_from_slice(&self.values[src * row_len..(src + 1) * row_len]);
            }
        }
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = rows;
        }
        Tensor { shape, values }
    }
}

fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn row_len(shape: &[usize]) -> usize {
    shape.iter().skip(1).product()
}

/// Variable name to tensor
pub type VarMap = BTreeMap<String, Tensor>;

/// How a variable is placed across processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartitionSpec {
    /// Every process holds the whole variable
    #[default]
    Replicated,

    /// The leading axis is split evenly across processes
    Sharded,
}

/// Static description of one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub shape: Vec<usize>,
    #[serde(default)]
    pub partition: PartitionSpec,
}

impl VariableSpec {
    pub fn replicated(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            partition: PartitionSpec::Replicated,
        }
    }

    pub fn sharded(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            partition: PartitionSpec::Sharded,
        }
    }

    /// Global shape after padding the sharded axis to a multiple of `num_shards`
    pub fn padded_shape(&self, num_shards: usize) -> Vec<usize> {
        let mut shape = self.shape.clone();
        if self.partition == PartitionSpec::Sharded && num_shards > 1 {
            if let Some(first) = shape.first_mut() {
                *first = first.div_ceil(num_shards) * num_shards;
            }
        }
        shape
    }

    /// Shape held by a single process
    pub fn local_shape(&self, num_shards: usize) -> Vec<usize> {
        let mut shape = self.padded_shape(num_shards);
        if self.partition == PartitionSpec::Sharded {
            if let Some(first) = shape.first_mut() {
                *first /= num_shards.max(1);
            }
        }
        shape
    }
}

/// Shape and placement description derived once before the loop starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStateMetadata {
    /// Model variables
    pub variables: BTreeMap<String, VariableSpec>,

    /// Optimizer accumulators
    pub opt_variables: BTreeMap<String, VariableSpec>,

    /// Whether the state carries an EMA copy of the model variables
    pub has_ema: bool,

    /// Number of shards for sharded variables
    pub num_shards: usize,
}

impl TrainStateMetadata {
    pub fn unpadded_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        self.all_specs()
            .map(|(name, spec)| (name, spec.shape.clone()))
            .collect()
    }

    pub fn padded_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        self.all_specs()
            .map(|(name, spec)| (name, spec.padded_shape(self.num_shards)))
            .collect()
    }

    pub fn partition_specs(&self) -> BTreeMap<String, PartitionSpec> {
        self.all_specs()
            .map(|(name, spec)| (name, spec.partition))
            .collect()
    }

    /// Parameter count from unpadded model variable shapes
    pub fn total_num_params(&self) -> u64 {
        self.variables
            .values()
            .map(|spec| num_elements(&spec.shape) as u64)
            .sum()
    }

    fn all_specs(&self) -> impl Iterator<Item = (String, &VariableSpec)> {
        self.variables
            .iter()
            .map(|(n, s)| (format!("mdl/{n}"), s))
            .chain(self.opt_variables.iter().map(|(n, s)| (format!("opt/{n}"), s)))
    }
}

/// Where a train state came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum StateProvenance {
    /// Freshly initialized from a seed
    Initialized { init_key: [u64; 2] },

    /// Restored from a committed checkpoint
    Restored { step: Step, path: String },
}

/// The complete mutable state of the computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub step: Step,
    pub mdl_vars: VarMap,
    pub opt_states: VarMap,
    pub ema_vars: Option<VarMap>,
}

impl TrainState {
    /// Fresh, unpadded global state.
    ///
    /// Model variables are drawn uniformly from `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`,
    /// optimizer accumulators start at zero and EMA starts as a copy of the model.
    pub fn initialize(metadata: &TrainStateMetadata, init_key: PrngKey) -> Self {
        let mut mdl_vars = VarMap::new();
        for (index, (name, spec)) in metadata.variables.iter().enumerate() {
            let fan_in = spec.shape.first().copied().unwrap_or(1).max(1) as f32;
            let scale = 1.0 / fan_in.sqrt();
            let dist = Uniform::new_inclusive(-scale, scale);
            let mut rng = init_key.fold_in(index as u64).into_rng();
            let values = (0..num_elements(&spec.shape))
                .map(|_| dist.sample(&mut rng))
                .collect();
            mdl_vars.insert(
                name.clone(),
                Tensor {
                    shape: spec.shape.clone(),
                    values,
                },
            );
        }

        let opt_states = metadata
            .opt_variables
            .iter()
            .map(|(name, spec)| (name.clone(), Tensor::zeros(&spec.shape)))
            .collect();

        let ema_vars = metadata.has_ema.then(|| mdl_vars.clone());

        Self {
            step: 0,
            mdl_vars,
            opt_states,
            ema_vars,
        }
    }

    /// Number of model parameters held by this state
    pub fn num_params(&self) -> u64 {
        self.mdl_vars.values().map(|t| t.len() as u64).sum()
    }

    /// The read-only EMA view used for decoding
    pub fn extract_ema(&self) -> Result<TrainState> {
        let ema = self.ema_vars.as_ref().ok_or(Error::EmaUnavailable)?;
        Ok(TrainState {
            step: self.step,
            mdl_vars: ema.clone(),
            opt_states: VarMap::new(),
            ema_vars: None,
        })
    }

    /// This process's slice of an unpadded global state
    pub fn local_shard(&self, metadata: &TrainStateMetadata, process: ProcessIndex) -> Result<Self> {
        let num_shards = metadata.num_shards.max(1);
        let shard = |vars: &VarMap, specs: &BTreeMap<String, VariableSpec>| -> Result<VarMap> {
            specs
                .iter()
                .map(|(name, spec)| {
                    let tensor = vars.get(name).ok_or_else(|| Error::VariableNotFound {
                        name: name.clone(),
                    })?;
                    let local = match spec.partition {
                        PartitionSpec::Replicated => tensor.clone(),
                        PartitionSpec::Sharded => {
                            let rows = spec.local_shape(num_shards)[0];
                            tensor.rows(process * rows, rows)
                        }
                    };
                    Ok((name.clone(), local))
                })
                .collect()
        };

        let ema_vars = match &self.ema_vars {
            Some(ema) => Some(shard(ema, &metadata.variables)?),
            None => None,
        };

        Ok(TrainState {
            step: self.step,
            mdl_vars: shard(&self.mdl_vars, &metadata.variables)?,
            opt_states: shard(&self.opt_states, &metadata.opt_variables)?,
            ema_vars,
        })
    }

    /// Check this state against the local shapes implied by `metadata`.
    ///
    /// Every tensor must carry exactly as many values as its shape implies.
    pub fn check_local_shapes(&self, metadata: &TrainStateMetadata, sharded: bool) -> Result<()> {
        let num_shards = if sharded { metadata.num_shards.max(1) } else { 1 };
        check_vars(&self.mdl_vars, &metadata.variables, "mdl", num_shards)?;
        check_vars(&self.opt_states, &metadata.opt_variables, "opt", num_shards)?;
        match (&self.ema_vars, metadata.has_ema) {
            (Some(ema), _) => check_vars(ema, &metadata.variables, "ema", num_shards),
            (None, true) => Err(Error::VariableNotFound {
                name: "ema".to_string(),
            }),
            (None, false) => Ok(()),
        }
    }
}

fn check_vars(
    vars: &VarMap,
    specs: &BTreeMap<String, VariableSpec>,
    prefix: &str,
    num_shards: usize,
) -> Result<()> {
    for (name, spec) in specs {
        let qualified = format!("{prefix}/{name}");
        let tensor = vars.get(name).ok_or_else(|| Error::VariableNotFound {
            name: qualified.clone(),
        })?;
        let shape = spec.local_shape(num_shards);
        if tensor.shape != shape {
            return Err(Error::ShapeMismatch {
                name: qualified,
                expected: shape,
                actual: tensor.shape.clone(),
            });
        }
        if tensor.values.len() != num_elements(&shape) {
            return Err(Error::ShapeMismatch {
                name: qualified,
                expected: vec![num_elements(&shape)],
                actual: vec![tensor.values.len()],
            });
        }
    }
    Ok(())
}
