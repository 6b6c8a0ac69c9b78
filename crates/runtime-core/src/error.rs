//! Error types for the training loop runtime

use thiserror::Error;

use crate::types::Step;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the training loop runtime
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {field} = {value:?}: {message}")]
    InvalidConfig {
        field: String,
        value: String,
        message: String,
    },

    #[error("Unable to parse string duration `{value}`")]
    InvalidDuration { value: String },

    #[error("Duplicate {kind} input name: {name}")]
    DuplicateInputName { kind: String, name: String },

    #[error("decode_use_ema_states is requested but the train state has no EMA variables")]
    EmaUnavailable,

    #[error("Unsupported checkpoint type: {checkpoint_type}")]
    UnsupportedCheckpointType { checkpoint_type: String },

    #[error("Checkpoint step {expected} and restored step {actual} mismatch")]
    RestoredStepMismatch { expected: Step, actual: Step },

    #[error("Program {program} used before setup")]
    ProgramNotSetUp { program: String },

    // State errors
    #[error("Shape mismatch for variable {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Variable not found in train state: {name}")]
    VariableNotFound { name: String },

    // Checkpoint errors
    #[error("Checkpoint not found: step {step}")]
    CheckpointNotFound { step: Step },

    #[error("Checkpoint write failed at step {step}: {message}")]
    CheckpointWriteFailed { step: Step, message: String },

    #[error("Checkpoint corrupted: step {step} - {reason}")]
    CheckpointCorrupted { step: Step, reason: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Coordination errors
    #[error("Barrier timeout: {tag} (waited {timeout_ms}ms, {arrived}/{expected} arrived)")]
    BarrierTimeout {
        tag: String,
        timeout_ms: u64,
        arrived: usize,
        expected: usize,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Shorthand for an `InvalidConfig` error naming the offending field.
    pub fn invalid_config(
        field: impl Into<String>,
        value: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        Error::InvalidConfig {
            field: field.into(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if this error is a configuration error that must abort the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::InvalidDuration { .. }
                | Error::DuplicateInputName { .. }
                | Error::EmaUnavailable
                | Error::UnsupportedCheckpointType { .. }
                | Error::RestoredStepMismatch { .. }
                | Error::ProgramNotSetUp { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
