//! Core type definitions for the training loop runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::config::ExecutionMode;
use crate::Error;

/// Training step counter
pub type Step = u64;

/// Index of a cooperating process
pub type ProcessIndex = usize;

/// Barrier identifier
pub type BarrierTag = String;

/// Checkpoint representation variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    /// One complete copy written by the primary process
    Replicated,

    /// One shard per process plus a commit marker
    Sharded,
}

impl CheckpointType {
    /// The representation used for a given execution mode
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Replicated => CheckpointType::Replicated,
            ExecutionMode::Sharded => CheckpointType::Sharded,
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointType::Replicated => write!(f, "replicated"),
            CheckpointType::Sharded => write!(f, "sharded"),
        }
    }
}

impl FromStr for CheckpointType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replicated" => Ok(CheckpointType::Replicated),
            "sharded" => Ok(CheckpointType::Sharded),
            _ => Err(Error::UnsupportedCheckpointType {
                checkpoint_type: s.to_string(),
            }),
        }
    }
}

/// Commit record of a durable checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    /// Training step at checkpoint
    pub step: Step,

    /// Storage path of the step directory
    pub path: String,

    /// Total size of all items in bytes
    pub size_bytes: u64,

    /// Timestamp when the save was requested
    pub created_at: DateTime<Utc>,

    /// Representation variant
    pub checkpoint_type: CheckpointType,

    /// Number of shard items written
    pub num_shards: usize,

    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

/// Barrier state for synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierState {
    /// Barrier tag
    pub tag: BarrierTag,

    /// Expected number of participants
    pub expected_participants: usize,

    /// Processes that have arrived
    pub arrived: BTreeSet<ProcessIndex>,

    /// Whether barrier has been released
    pub released: bool,

    /// Timestamp when barrier was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when barrier was released
    pub released_at: Option<DateTime<Utc>>,
}

impl BarrierState {
    /// Create a new barrier
    pub fn new(tag: BarrierTag, expected_participants: usize) -> Self {
        Self {
            tag,
            expected_participants,
            arrived: BTreeSet::new(),
            released: false,
            created_at: Utc::now(),
            released_at: None,
        }
    }

    /// Record a process arrival, returns true if barrier should be released
    pub fn arrive(&mut self, process: ProcessIndex) -> bool {
        self.arrived.insert(process);

        if self.arrived.len() >= self.expected_participants && !self.released {
            self.released = true;
            self.released_at = Some(Utc::now());
            return true;
        }

        false
    }
}

/// Which kinds of programs produced metrics in the current iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RunningMode(u8);

impl RunningMode {
    pub const UNKNOWN: RunningMode = RunningMode(0);
    pub const TRAIN: RunningMode = RunningMode(1);
    pub const EVAL: RunningMode = RunningMode(1 << 1);
    pub const DECODE: RunningMode = RunningMode(1 << 2);

    /// Build a mode from the metrics available in an iteration
    pub fn detect(has_train_metrics: bool, has_eval_metrics: bool, has_decode_metrics: bool) -> Self {
        let mut mode = RunningMode::UNKNOWN;
        if has_train_metrics {
            mode = mode | RunningMode::TRAIN;
        }
        if has_eval_metrics {
            mode = mode | RunningMode::EVAL;
        }
        if has_decode_metrics {
            mode = mode | RunningMode::DECODE;
        }
        mode
    }

    pub fn has_train(self) -> bool {
        self.0 & RunningMode::TRAIN.0 != 0
    }

    pub fn has_eval(self) -> bool {
        self.0 & RunningMode::EVAL.0 != 0
    }

    pub fn has_decode(self) -> bool {
        self.0 & RunningMode::DECODE.0 != 0
    }
}

impl std::ops::BitOr for RunningMode {
    type Output = RunningMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        RunningMode(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_state() {
        let mut barrier = BarrierState::new("start".to_string(), 3);

        assert!(!barrier.arrive(0));
        assert!(!barrier.arrive(1));
        assert!(!barrier.arrive(1));
        assert!(barrier.arrive(2));
        assert!(barrier.released);
        assert!(barrier.released_at.is_some());
        assert!(!barrier.arrive(2));
    }

    #[test]
    fn test_checkpoint_type_parse() {
        assert_eq!("Sharded".parse::<CheckpointType>().unwrap(), CheckpointType::Sharded);
        assert_eq!(
            "replicated".parse::<CheckpointType>().unwrap(),
            CheckpointType::Replicated
        );
        assert!("gda".parse::<CheckpointType>().is_err());
    }

    #[test]
    fn test_running_mode_detect() {
        let mode = RunningMode::detect(true, false, true);
        assert!(mode.has_train());
        assert!(!mode.has_eval());
        assert!(mode.has_decode());
        assert_eq!(RunningMode::detect(false, false, false), RunningMode::UNKNOWN);
    }
}
