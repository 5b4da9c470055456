//! Error types for DSP processing

use thiserror::Error;

/// DSP error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    /// Transform or filter configuration is not usable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Buffer or spectrogram dimensions do not agree
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// FFT backend rejected a buffer
    #[error("FFT failed: {0}")]
    Fft(String),
}

/// Result type alias
pub type DspResult<T> = Result<T, DspError>;
