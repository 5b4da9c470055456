//! Error types for ML processing

use loco_dsp::DspError;
use thiserror::Error;

/// ML processing error types
#[derive(Error, Debug)]
pub enum MlError {
    /// Model or engine configuration violates an invariant
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Forward called on a layer that never received weights
    #[error("Weights not loaded: {layer}")]
    WeightsNotLoaded { layer: String },

    /// Requested compute device could not be acquired
    #[error("Device unavailable: {0}")]
    Device(String),

    /// Weight blob missing, corrupt, or inconsistent with the config
    #[error("Failed to load weights {key}: {reason}")]
    WeightLoad { key: String, reason: String },

    /// Sequence longer than the rotary table
    #[error("Sequence length {len} exceeds rotary table of {max} positions")]
    PositionOverflow { len: usize, max: usize },

    /// Free tier ended up on a non-CPU device
    #[error("Tier violation: {0}")]
    TierViolation(String),

    /// Request tier differs from the tier the engine was initialized for
    #[error("Engine initialized for {initialized} tier, request asked for {requested}")]
    TierMismatch {
        initialized: String,
        requested: String,
    },

    /// Engine is not in the Ready state
    #[error("Engine not ready: {0}")]
    NotReady(String),

    /// Caller cancelled processing
    #[error("Separation cancelled")]
    Cancelled,

    /// A derived operation needed a stem the model did not produce
    #[error("Missing stem: {0}")]
    MissingStem(String),

    /// Audio buffer or options rejected before processing
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tensor dimensions do not agree
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// STFT / filter failure
    #[error("Transform error: {0}")]
    Transform(#[from] DspError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Header or config (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MlError {
    fn from(e: serde_json::Error) -> Self {
        MlError::Serialization(e.to_string())
    }
}

impl MlError {
    pub(crate) fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        MlError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Result type for ML operations
pub type MlResult<T> = Result<T, MlError>;
