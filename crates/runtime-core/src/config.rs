//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{CheckpointType, Step};
use crate::{Error, Result};

/// How the train state is laid out across the cooperating processes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every process holds a complete copy of the state
    #[default]
    Replicated,

    /// Every process holds only its own shard of the state
    Sharded,
}

/// Main training loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Root directory for checkpoints and summaries
    pub job_log_dir: PathBuf,

    /// Root random seed for initialization and train/eval/decode streams
    pub random_seed: u64,

    /// Train until the step counter reaches this value
    pub num_train_steps: Step,

    /// Save a checkpoint every N steps (0 disables periodic saves)
    pub save_interval_steps: Step,

    /// Retain at most N most recent checkpoints (None keeps all)
    pub save_max_to_keep: Option<usize>,

    /// Keep one checkpoint per wall-clock interval, e.g. "30m"
    pub save_keep_interval_duration: Option<String>,

    /// Run eval programs every N steps (0 disables eval)
    pub eval_interval_steps: Step,

    /// Run decode programs every N steps (0 disables decode)
    pub decode_interval_steps: Step,

    /// Decode against the EMA variables instead of the live ones
    pub decode_use_ema_states: bool,

    /// When false, saves are no-ops but restore still works
    pub enable_checkpoint_saving: bool,

    /// Save and exit with status 1 as soon as preemption is signaled
    pub exit_after_ondemand_checkpoint: bool,

    /// Move pruned checkpoints here instead of deleting them
    pub checkpoint_todelete_subdir: Option<String>,

    /// State layout across processes
    pub execution_mode: ExecutionMode,

    /// Checkpoint representation; defaults to the one matching `execution_mode`
    pub checkpoint_type: Option<String>,

    /// Write train summaries every N steps (0 disables them)
    pub summary_interval_steps: Step,

    /// Maximum time to wait on a barrier
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,

    /// Number of tokio worker threads for the binary
    pub io_threads: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            job_log_dir: PathBuf::from("./job"),
            random_seed: 1234,
            num_train_steps: 1000,
            save_interval_steps: 100,
            save_max_to_keep: Some(10),
            save_keep_interval_duration: None,
            eval_interval_steps: 0,
            decode_interval_steps: 0,
            decode_use_ema_states: false,
            enable_checkpoint_saving: true,
            exit_after_ondemand_checkpoint: false,
            checkpoint_todelete_subdir: None,
            execution_mode: ExecutionMode::default(),
            checkpoint_type: None,
            summary_interval_steps: 100,
            barrier_timeout: Duration::from_secs(300),
            io_threads: 4,
        }
    }
}

impl TrainConfig {
    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: TrainConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option that can be rejected before the run starts
    pub fn validate(&self) -> Result<()> {
        if self.io_threads == 0 {
            return Err(Error::invalid_config(
                "io_threads",
                self.io_threads,
                "must be at least 1",
            ));
        }
        if self.save_max_to_keep == Some(0) {
            return Err(Error::invalid_config(
                "save_max_to_keep",
                0,
                "must be positive when set",
            ));
        }
        if let Some(subdir) = &self.checkpoint_todelete_subdir {
            if subdir.is_empty() || subdir.contains('/') || subdir.parse::<Step>().is_ok() {
                return Err(Error::invalid_config(
                    "checkpoint_todelete_subdir",
                    subdir,
                    "must be a single non-numeric path component",
                ));
            }
        }
        self.keep_time_interval()?;
        self.resolved_checkpoint_type()?;
        Ok(())
    }

    /// Parsed `save_keep_interval_duration`
    pub fn keep_time_interval(&self) -> Result<Option<Duration>> {
        parse_duration(self.save_keep_interval_duration.as_deref())
    }

    /// Checkpoint representation for this run
    pub fn resolved_checkpoint_type(&self) -> Result<CheckpointType> {
        let default = CheckpointType::for_mode(self.execution_mode);
        let Some(name) = &self.checkpoint_type else {
            return Ok(default);
        };
        let requested: CheckpointType = name.parse()?;
        if requested != default {
            return Err(Error::UnsupportedCheckpointType {
                checkpoint_type: format!("{} with {:?} execution", requested, self.execution_mode),
            });
        }
        Ok(requested)
    }

    /// Directory holding step-indexed checkpoints
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.job_log_dir.join("checkpoints")
    }

    /// Directory holding summary sinks
    pub fn summary_dir(&self) -> PathBuf {
        self.job_log_dir.join("summaries")
    }
}

/// Parse a duration such as `"45"`, `"30s"`, `"15m"`, `"2h"` or `"1d"`.
///
/// A bare integer is read as seconds. `None` and the empty string mean
/// "no interval".
pub fn parse_duration(value: Option<&str>) -> Result<Option<Duration>> {
    let Some(raw) = value else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }

    let invalid = || Error::InvalidDuration {
        value: raw.to_string(),
    };

    let digits_end = raw
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    if digits_end == 0 {
        return Err(invalid());
    }

    let amount: u64 = raw[..digits_end].parse().map_err(|_| invalid())?;
    let multiplier = match &raw[digits_end..] {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(invalid()),
    };

    amount
        .checked_mul(multiplier)
        .map(|secs| Some(Duration::from_secs(secs)))
        .ok_or_else(invalid)
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrainConfig::default();
        assert_eq!(config.save_interval_steps, 100);
        assert!(config.enable_checkpoint_saving);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = TrainConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.num_train_steps, config.num_train_steps);
        assert_eq!(parsed.barrier_timeout, config.barrier_timeout);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: TrainConfig =
            serde_json::from_str(r#"{"num_train_steps": 20, "execution_mode": "sharded"}"#).unwrap();
        assert_eq!(parsed.num_train_steps, 20);
        assert_eq!(parsed.execution_mode, ExecutionMode::Sharded);
        assert_eq!(parsed.save_interval_steps, 100);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration(None).unwrap(), None);
        assert_eq!(parse_duration(Some("")).unwrap(), None);
        assert_eq!(parse_duration(Some("45")).unwrap(), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration(Some("45s")).unwrap(), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration(Some("10m")).unwrap(), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration(Some("3h")).unwrap(), Some(Duration::from_secs(10800)));
        assert_eq!(parse_duration(Some("2d")).unwrap(), Some(Duration::from_secs(172800)));
    }

    #[test]
    fn test_parse_duration_rejects_unknown_suffix() {
        for bad in ["10w", "5ms", "h", "abc", "-3s", "1.5h"] {
            let err = parse_duration(Some(bad)).unwrap_err();
            assert!(matches!(err, Error::InvalidDuration { .. }), "{bad}");
        }
    }

    #[test]
    fn test_checkpoint_type_must_match_mode() {
        let config = TrainConfig {
            execution_mode: ExecutionMode::Replicated,
            checkpoint_type: Some("sharded".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::UnsupportedCheckpointType { .. })
        ));

        let config = TrainConfig {
            checkpoint_type: Some("flax".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.resolved_checkpoint_type(),
            Err(Error::UnsupportedCheckpointType { .. })
        ));
    }

    #[test]
    fn test_invalid_keep_duration_rejected() {
        let config = TrainConfig {
            save_keep_interval_duration: Some("2w".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidDuration { .. })));
    }
}
